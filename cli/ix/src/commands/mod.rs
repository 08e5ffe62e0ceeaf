//! CLI command implementations.

pub mod cache;
pub mod inspect;
pub mod load;
pub mod resolve;

use anyhow::{bail, Result};
use clap::Args;
use serde_json::Value;

use ix_hub::{Credentials, LoadRequest};

/// The reference a command operates on.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Builtin name, local directory, `org/repo`, or repository URL
    pub reference: String,
    /// Tag, branch, or commit (default branch if omitted)
    #[arg(long)]
    pub revision: Option<String>,
    /// Username for private remotes
    #[arg(long, requires = "token")]
    pub username: Option<String>,
    /// Access token for private remotes (also read from IX_TOKEN)
    #[arg(long, env = "IX_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Re-resolve and re-fetch even when cached
    #[arg(long)]
    pub force_reload: bool,
}

impl SourceArgs {
    pub fn request(&self) -> LoadRequest {
        let mut request = LoadRequest::new(&self.reference).force_reload(self.force_reload);
        if let Some(rev) = &self.revision {
            request = request.revision(rev);
        }
        if let Some(token) = &self.token {
            let user = self.username.as_deref().unwrap_or("x-access-token");
            request = request.credentials(Credentials::new(user, token));
        }
        request
    }
}

/// Split `key=value`, reading the value as JSON when it parses and as a
/// plain string otherwise.
pub fn parse_key_value(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected KEY=VALUE, got '{raw}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("empty key in '{raw}'");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
