//! Command-line front end for resolving, caching and loading Interaxions components.

mod commands;
mod logging;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use ix_hub::{BranchPolicy, Hub, HubConfig};

use commands::SourceArgs;

#[derive(Parser)]
#[command(name = "ix", version, about = "Interaxions component hub")]
struct Cli {
    #[command(flatten)]
    hub: HubArgs,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides applied on top of the config file and environment.
#[derive(Args, Debug, Default)]
struct HubArgs {
    /// Cache root (default: $IX_HUB_CACHE or $IX_HOME/hub)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Base URL for `org/repo` references
    #[arg(long, global = true)]
    endpoint: Option<String>,
    /// Never contact remotes; only pinned cached revisions load
    #[arg(long, global = true)]
    offline: bool,
    /// Seconds to wait for another writer's lock
    #[arg(long, global = true)]
    lock_timeout: Option<u64>,
    /// Seconds allowed for each git invocation
    #[arg(long, global = true)]
    fetch_timeout: Option<u64>,
    /// Branch handling on repeated loads (refresh, pinned)
    #[arg(long, global = true)]
    branch_policy: Option<String>,
}

impl HubArgs {
    fn apply(&self, mut config: HubConfig) -> anyhow::Result<HubConfig> {
        if let Some(dir) = &self.cache_dir {
            config = config.with_cache_dir(dir);
        }
        if let Some(endpoint) = &self.endpoint {
            config = config.with_endpoint(endpoint);
        }
        if self.offline {
            config = config.with_offline(true);
        }
        if let Some(secs) = self.lock_timeout {
            config = config.with_lock_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.fetch_timeout {
            config = config.with_fetch_timeout(Duration::from_secs(secs));
        }
        if let Some(policy) = &self.branch_policy {
            config = config.with_branch_policy(policy.parse::<BranchPolicy>()?);
        }
        Ok(config)
    }

    fn hub(&self) -> anyhow::Result<Hub> {
        let config = self.apply(HubConfig::load().context("loading hub configuration")?)?;
        let cwd = std::env::current_dir()?;
        Hub::builder(config)
            .base_dir(cwd)
            .build()
            .context("configuring hub")
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a reference to a cached module and print where it lives
    Resolve {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Show a module's declared configuration and implementations
    Inspect {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Load a component and print the task it produces for a job
    Load {
        #[command(flatten)]
        source: SourceArgs,
        /// Constructor argument (key=value, value parsed as JSON when possible)
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
        /// Expected role (agent, environment, workflow)
        #[arg(long)]
        role: Option<String>,
        /// Job name
        #[arg(long, default_value = "job")]
        job: String,
        /// Job parameter (key=value)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Manage the module cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List published entries
    List,
    /// Remove entries for one reference, or everything
    Clear {
        /// Reference to clear (all entries if omitted)
        reference: Option<String>,
        /// Only entries for this revision or commit prefix
        #[arg(long, requires = "reference")]
        revision: Option<String>,
    },
    /// Delete unreferenced objects and abandoned staging directories
    Prune,
    /// Print the cache root
    Path,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("warning: {e:#}");
    }

    let result = run(cli);
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let hub = cli.hub.hub()?;

    match cli.command {
        Commands::Resolve { source } => commands::resolve::run(&hub, &source),
        Commands::Inspect { source } => commands::inspect::run(&hub, &source),
        Commands::Load {
            source,
            args,
            role,
            job,
            params,
        } => commands::load::run(
            &hub,
            &source,
            &commands::load::LoadOptions {
                args,
                role,
                job,
                params,
            },
        ),
        Commands::Cache { action } => match action {
            CacheAction::List => commands::cache::list(&hub),
            CacheAction::Clear {
                reference,
                revision,
            } => commands::cache::clear(&hub, reference.as_deref(), revision.as_deref()),
            CacheAction::Prune => commands::cache::prune(&hub),
            CacheAction::Path => commands::cache::path(&hub),
        },
    }
}
