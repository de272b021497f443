//! Identity linking against the identity cloud.
//!
//! A linking call associates a cloud user with an account in another system:
//! a federation account, a legacy directory account or an LDAP gateway
//! identity. Calls carry a client-credentials bearer token that is refreshed
//! only when the identity cloud answers 401 or 403.

mod client;
mod colleague;
mod token;

pub use client::{Capabilities, LinkingClient, Support};
pub use colleague::LinkingColleague;
pub use token::{ClientCredentialsTokenProvider, TokenSource};

use crate::mediator::ColleagueOperation;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    Federation,
    Directory,
    Gateway,
}

impl LinkTarget {
    pub const ALL: [LinkTarget; 3] = [
        LinkTarget::Federation,
        LinkTarget::Directory,
        LinkTarget::Gateway,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            LinkTarget::Federation => "federation-account",
            LinkTarget::Directory => "directory-account",
            LinkTarget::Gateway => "gateway-identity",
        }
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkTarget {
    type Err = LinkingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LinkTarget::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LinkingError::InvalidRequest(format!("unknown link target {s}")))
    }
}

/// Result of a link call that reached the identity cloud.
#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum LinkOutcome {
    /// The identity cloud's own record of the link.
    Linked(serde_json::Value),
    Failed(LinkingFailure),
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkingFailure {
    pub contains_error: bool,
    pub error_message: String,
    pub error_status_code: u16,
}

impl LinkingFailure {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        LinkingFailure {
            contains_error: true,
            error_message: message.into(),
            error_status_code: status,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LinkingError {
    #[error("operation {0} is not supported")]
    Unsupported(ColleagueOperation),

    #[error("identity cloud rejected credentials for {uri} after a token refresh")]
    Unauthorized { uri: String },

    #[error("unlink at {uri} returned {status}, expected 204")]
    Conflict { uri: String, status: u16 },

    #[error("token acquisition failed: {0}")]
    Token(String),

    #[error("invalid linking request: {0}")]
    InvalidRequest(String),

    #[error("identity cloud request failed: {0}")]
    Transport(#[from] reqwest::Error),
}
