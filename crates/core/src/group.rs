//! Group outcome types.

use crate::request::RequestKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// State carried by a group event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupEventState {
    /// The batch was accepted.
    Granted,
    /// The batch was rejected before any request was created.
    Denied,
    /// Every request of the group succeeded.
    Success,
    /// At least one request of the group failed.
    Error,
}

impl GroupEventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Outcome of one terminated request within a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResultInfo {
    pub group_id: String,
    pub kind: RequestKind,
    pub checksum: String,
    pub backend: String,
    pub owners: BTreeSet<String>,
    pub is_error: bool,
    pub error_cause: Option<String>,
    /// Location of the produced file, when the request produced one.
    pub result_file: Option<String>,
}
