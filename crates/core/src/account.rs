use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the lock flag inside an account record
pub const LOCKED_FIELD: &str = "locked";

/// Secret signing key of a pooled account. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// One shared signing account.
///
/// `locked` is true exactly while the account is leased to an in-flight action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    #[serde(alias = "pk")]
    pub credential: Credential,
    pub address: String,
    #[serde(default)]
    pub locked: bool,
}

impl AccountRecord {
    pub fn new(credential: Credential, address: impl Into<String>) -> Self {
        Self {
            credential,
            address: address.into(),
            locked: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_debug_redacts_credential() {
        let account = AccountRecord::new(Credential::new("0xdeadbeef"), "0xabc");
        let printed = format!("{:?}", account);
        assert!(!printed.contains("deadbeef"));
        assert!(printed.contains("0xabc"));
    }

    #[test]
    fn test_accepts_legacy_pk_field_and_missing_lock() {
        let account: AccountRecord =
            serde_json::from_value(json!({"pk": "0x01", "address": "0xabc"})).unwrap();
        assert_eq!(account.credential.expose(), "0x01");
        assert!(!account.locked);
    }

    #[test]
    fn test_serializes_lock_flag() {
        let value = serde_json::to_value(AccountRecord::new(Credential::new("0x01"), "0xabc")).unwrap();
        assert_eq!(value, json!({"credential": "0x01", "address": "0xabc", "locked": false}));
    }
}
