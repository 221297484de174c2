//! Jobs: one in-flight worker invocation against a target.
//!
//! The records themselves live in the manager's job map; this module holds
//! the job vocabulary and the interpretation of worker output per job kind.

use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    List,
    Describe,
    CheckNew,
    Update,
    Vacuum,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::List => "list",
            JobKind::Describe => "describe",
            JobKind::CheckNew => "check-new",
            JobKind::Update => "update",
            JobKind::Vacuum => "vacuum",
        }
    }

    /// Update and vacuum modify the target and take its exclusive slot.
    pub fn is_mutating(&self) -> bool {
        matches!(self, JobKind::Update | JobKind::Vacuum)
    }
}

pub fn object_path(id: u64) -> String {
    format!("/sysupdate1/job/_{id}")
}

/// What a held RMI caller receives when its job resolves.
#[derive(Debug)]
pub enum JobReply {
    /// An update worker passed its sanity checks and continues in the
    /// background; the caller is answered with the job coordinates.
    Detached {
        version: String,
        id: u64,
        object_path: String,
    },
    /// The worker exited: the parsed stdout document, or the failure.
    Finished(Result<Value>),
}

/// Extract a string array from a worker document.
pub(crate) fn string_array(v: &Value, verb: &'static str, key: &str) -> Result<Vec<String>> {
    let items = v.as_array().ok_or_else(|| Error::Protocol {
        verb,
        message: format!("expected array of strings for key '{key}'"),
    })?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| Error::Protocol {
                verb,
                message: format!("expected array of strings for key '{key}'"),
            })
        })
        .collect()
}

/// List completion: key `all` holds every known version.
pub fn list_versions_from(json: &Value) -> Result<Vec<String>> {
    let v = json.get("all").ok_or_else(|| Error::Protocol {
        verb: "list",
        message: "missing key 'all'".to_string(),
    })?;
    string_array(v, "list", "all")
}

/// Describe completion: the whole document, re-serialized as one string.
pub fn describe_text(json: &Value) -> Result<String> {
    serde_json::to_string(json).map_err(Error::Json)
}

/// Check-new completion: key `available` is the new version, or null when
/// the target is current.
pub fn check_new_from(json: &Value) -> Result<String> {
    match json.get("available") {
        None => Err(Error::Protocol {
            verb: "check-new",
            message: "missing key 'available'".to_string(),
        }),
        Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(Error::Protocol {
            verb: "check-new",
            message: "expected string or null for key 'available'".to_string(),
        }),
    }
}

/// Vacuum completion: key `removed` counts the deleted instances.
pub fn vacuum_count_from(json: &Value) -> u32 {
    json.get("removed").and_then(Value::as_u64).unwrap_or(0) as u32
}
