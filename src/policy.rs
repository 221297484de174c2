//! Policy gate for RMI methods.
//!
//! Decisions are delegated to an external policy service over a unix stream
//! socket, one JSON request/response exchange per check. Without a
//! configured socket every check is allowed, which is the development and
//! test mode.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{Error, Result};

/// Actions understood by the policy service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Read-only queries: list, describe, check-new, and their cancellation.
    Check,
    /// Update to the latest version, and its cancellation.
    Update,
    /// Update to a caller-chosen version, and its cancellation.
    UpdateToVersion,
    /// Vacuum, and its cancellation.
    Vacuum,
}

impl PolicyAction {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyAction::Check => "sysupdate.check",
            PolicyAction::Update => "sysupdate.update",
            PolicyAction::UpdateToVersion => "sysupdate.update-to-version",
            PolicyAction::Vacuum => "sysupdate.vacuum",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
    /// The service wants to ask the user; the caller has to retry with
    /// interactive authentication.
    Interactive,
}

#[derive(Debug, Deserialize)]
struct PolicyReply {
    result: String,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyClient {
    socket: Option<PathBuf>,
}

impl PolicyClient {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self { socket }
    }

    pub fn allow_all() -> Self {
        Self { socket: None }
    }

    /// Check an action and fail unless it is allowed, so method handlers can
    /// propagate the outcome directly with `?`.
    pub async fn require(&self, action: PolicyAction, details: &[(&str, &str)]) -> Result<()> {
        match self.check(action, details).await? {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny => Err(Error::AccessDenied(action.name().to_string())),
            PolicyDecision::Interactive => Err(Error::InteractionRequired),
        }
    }

    async fn check(&self, action: PolicyAction, details: &[(&str, &str)]) -> Result<PolicyDecision> {
        let Some(path) = &self.socket else {
            return Ok(PolicyDecision::Allow);
        };

        let stream = UnixStream::connect(path).await.map_err(|e| {
            Error::Policy(format!(
                "cannot reach policy service at {}: {e}",
                path.display()
            ))
        })?;
        let (read, mut write) = stream.into_split();

        let details: BTreeMap<&str, &str> = details.iter().copied().collect();
        let request = serde_json::json!({
            "action": action.name(),
            "details": details,
        });
        let mut line = serde_json::to_string(&request).map_err(Error::Json)?;
        line.push('\n');
        write
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Policy(format!("failed to send policy request: {e}")))?;

        let mut reader = BufReader::new(read);
        let mut reply = String::new();
        reader
            .read_line(&mut reply)
            .await
            .map_err(|e| Error::Policy(format!("failed to read policy reply: {e}")))?;

        let reply: PolicyReply = serde_json::from_str(reply.trim())
            .map_err(|e| Error::Policy(format!("malformed policy reply: {e}")))?;

        debug!(action = action.name(), result = %reply.result, "policy decision");

        match reply.result.as_str() {
            "allow" => Ok(PolicyDecision::Allow),
            "deny" => Ok(PolicyDecision::Deny),
            "interactive" => Ok(PolicyDecision::Interactive),
            other => Err(Error::Policy(format!("unknown policy result {other:?}"))),
        }
    }
}

/// Boolean rendering used in policy details.
pub fn one_zero(b: bool) -> &'static str {
    if b { "1" } else { "0" }
}
