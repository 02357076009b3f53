//! Credential verification for the `Authenticate` message.

use std::collections::BTreeMap;
use std::fmt;

use rmake_proto::HashType;
use sha2::{Digest, Sha256};

/// Result of checking one `Authenticate` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthOutcome {
    /// Credentials are valid.
    Accepted,
    /// Unknown user or wrong hash.
    Rejected,
    /// The hash type is not supported; the client may retry with another.
    UnsupportedHash,
}

/// Verifies client credentials.
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Checks `hash` (computed by the client over password and salt) for `username`.
    fn check(&self, username: &str, hash_type: i16, hash: &[u8]) -> AuthOutcome;
}

/// Computes the client-side credential hash: `H(password ‖ salt)`.
///
/// Returns `None` for hash types this build cannot compute.
pub fn hash_password(hash_type: HashType, password: &str, salt: &str) -> Option<Vec<u8>> {
    match hash_type {
        HashType::Sha256 => {
            let mut h = Sha256::new();
            h.update(password.as_bytes());
            h.update(salt.as_bytes());
            Some(h.finalize().to_vec())
        }
        _ => None,
    }
}

/// In-memory user → password table with a single server salt.
#[derive(Clone, Default)]
pub struct PasswordTable {
    /// Server salt appended to every password.
    salt: String,
    /// User name → plaintext password.
    users: BTreeMap<String, String>,
}

impl fmt::Debug for PasswordTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordTable")
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PasswordTable {
    /// Creates an empty table using `salt`.
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            salt: salt.into(),
            users: BTreeMap::new(),
        }
    }

    /// Adds or replaces a user.
    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

impl Authenticator for PasswordTable {
    fn check(&self, username: &str, hash_type: i16, hash: &[u8]) -> AuthOutcome {
        let Some(hash_type) = HashType::from_code(hash_type) else {
            return AuthOutcome::UnsupportedHash;
        };
        let Some(password) = self.users.get(username) else {
            return AuthOutcome::Rejected;
        };
        let Some(expected) = hash_password(hash_type, password, &self.salt) else {
            return AuthOutcome::UnsupportedHash;
        };
        if constant_time_eq(&expected, hash) {
            AuthOutcome::Accepted
        } else {
            AuthOutcome::Rejected
        }
    }
}

/// Compares two byte strings without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PasswordTable {
        PasswordTable::new("pepper").with_user("alice", "hunter2")
    }

    #[test]
    fn accepts_salted_sha256() {
        let hash = hash_password(HashType::Sha256, "hunter2", "pepper").unwrap();
        assert_eq!(hash.len(), 32);
        assert_eq!(
            table().check("alice", HashType::Sha256.code(), &hash),
            AuthOutcome::Accepted
        );
    }

    #[test]
    fn salt_is_appended() {
        let salted = hash_password(HashType::Sha256, "hunter2", "pepper").unwrap();
        let joined = hash_password(HashType::Sha256, "hunter2pepper", "").unwrap();
        assert_eq!(salted, joined);
    }

    #[test]
    fn rejects_wrong_password_and_unknown_user() {
        let wrong = hash_password(HashType::Sha256, "hunter3", "pepper").unwrap();
        assert_eq!(table().check("alice", 0, &wrong), AuthOutcome::Rejected);

        let unsalted = hash_password(HashType::Sha256, "hunter2", "").unwrap();
        assert_eq!(table().check("alice", 0, &unsalted), AuthOutcome::Rejected);

        let hash = hash_password(HashType::Sha256, "hunter2", "pepper").unwrap();
        assert_eq!(table().check("bob", 0, &hash), AuthOutcome::Rejected);
        assert_eq!(table().check("alice", 0, &hash[..31]), AuthOutcome::Rejected);
    }

    #[test]
    fn unknown_hash_type() {
        assert_eq!(table().check("alice", 42, b""), AuthOutcome::UnsupportedHash);
    }

    #[test]
    fn debug_hides_passwords() {
        let shown = format!("{:?}", table());
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("pepper"));
    }
}
