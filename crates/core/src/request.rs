//! Funding request records.
//!
//! Optional fields have documented defaults: a missing `tokens` means
//! [`RequestedTokens::All`], a missing `authLevel` means [`AuthLevel::None`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const STATUS_FIELD: &str = "status";
pub const RESULT_TX_HASH_FIELD: &str = "resultTxHash";
pub const TOKEN_TX_HASHES_FIELD: &str = "tokenTxHashes";

/// Lifecycle of a request: `Pending -> Working -> Done | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Working,
    Done,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Done | RequestStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Working => "Working",
            RequestStatus::Done => "Done",
            RequestStatus::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Faucet,
    /// Any type this processor does not know how to handle
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestedTokens {
    #[default]
    All,
    Stables,
    /// Only the chain's native token
    #[serde(rename = "Celo", alias = "Native")]
    Native,
}

impl RequestedTokens {
    pub fn includes_native(&self) -> bool {
        matches!(self, RequestedTokens::All | RequestedTokens::Native)
    }

    pub fn includes_stables(&self) -> bool {
        matches!(self, RequestedTokens::All | RequestedTokens::Stables)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    #[default]
    None,
    Authenticated,
}

/// One external funding request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub beneficiary: String,
    pub status: RequestStatus,
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default)]
    pub tokens: RequestedTokens,
    #[serde(default)]
    pub auth_level: AuthLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub token_tx_hashes: BTreeMap<String, String>,
}

impl RequestRecord {
    /// A new `Pending` faucet request for `beneficiary`.
    pub fn faucet(beneficiary: impl Into<String>) -> Self {
        Self {
            beneficiary: beneficiary.into(),
            status: RequestStatus::Pending,
            kind: RequestType::Faucet,
            tokens: RequestedTokens::default(),
            auth_level: AuthLevel::default(),
            result_tx_hash: None,
            token_tx_hashes: BTreeMap::new(),
        }
    }

    pub fn with_tokens(mut self, tokens: RequestedTokens) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_auth_level(mut self, auth_level: AuthLevel) -> Self {
        self.auth_level = auth_level;
        self
    }
}
