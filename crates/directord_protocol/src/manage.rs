//! Management requests accepted on the local submission socket.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The `{"manage": ...}` submission shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManageEnvelope {
    pub manage: ManageRequest,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ManageRequest {
    ListJobs,
    ListNodes,
    PurgeJobs,
    PurgeNodes,
}

impl ManageRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManageRequest::ListJobs => "list-jobs",
            ManageRequest::ListNodes => "list-nodes",
            ManageRequest::PurgeJobs => "purge-jobs",
            ManageRequest::PurgeNodes => "purge-nodes",
        }
    }
}

impl fmt::Display for ManageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ManageRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list-jobs" => Ok(ManageRequest::ListJobs),
            "list-nodes" => Ok(ManageRequest::ListNodes),
            "purge-jobs" => Ok(ManageRequest::PurgeJobs),
            "purge-nodes" => Ok(ManageRequest::PurgeNodes),
            other => Err(format!("Unknown manage request: '{other}'")),
        }
    }
}
