// src/credentials.rs
//! The credential-store seam used by the login and register endpoints.

use crate::error::{EmberError, EmberResult};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// A user table that may block (database, file). Only worker threads call it.
pub trait CredentialStore: Send + Sync {
    /// Stored credential for `user`, if the user exists.
    fn lookup(&self, user: &str) -> EmberResult<Option<String>>;

    /// Adds a new user. Returns `false` if the name is already taken.
    fn insert(&self, user: &str, password: &str) -> EmberResult<bool>;

    fn verify(&self, user: &str, password: &str) -> EmberResult<bool> {
        Ok(self.lookup(user)?.is_some_and(|stored| stored == password))
    }
}

/// Plaintext users held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    users: RwLock<HashMap<String, String>>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let users = users
            .into_iter()
            .map(|(u, p)| (u.into(), p.into()))
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for InMemoryCredentials {
    fn lookup(&self, user: &str) -> EmberResult<Option<String>> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(users.get(user).cloned())
    }

    fn insert(&self, user: &str, password: &str) -> EmberResult<bool> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(user) {
            return Ok(false);
        }
        users.insert(user.to_string(), password.to_string());
        Ok(true)
    }
}

/// User name and password carried in a form-encoded POST body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormCredentials {
    pub user: String,
    pub password: String,
}

impl FormCredentials {
    /// The first field's value is the user name, the last field's value is
    /// the password, whatever the field names are.
    pub fn from_body(body: &[u8]) -> EmberResult<Self> {
        let fields: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|e| EmberError::Credential(format!("malformed form body: {}", e)))?;
        match (fields.first(), fields.last()) {
            (Some((_, user)), Some((_, password))) if fields.len() >= 2 => Ok(Self {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => Err(EmberError::Credential(
                "form body needs a user and a password field".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_refuses_duplicates() {
        let store = InMemoryCredentials::new();
        assert!(store.insert("alice", "pw").unwrap());
        assert!(!store.insert("alice", "other").unwrap());
        assert_eq!(store.lookup("alice").unwrap().as_deref(), Some("pw"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn verify_compares_stored_value() {
        let store = InMemoryCredentials::with_users([("bob", "hunter2")]);
        assert!(store.verify("bob", "hunter2").unwrap());
        assert!(!store.verify("bob", "hunter3").unwrap());
        assert!(!store.verify("carol", "hunter2").unwrap());
    }

    #[test]
    fn form_takes_first_and_last_fields() {
        let form = FormCredentials::from_body(b"user=al%20ice&passwd=p%26w").unwrap();
        assert_eq!(form.user, "al ice");
        assert_eq!(form.password, "p&w");

        let form = FormCredentials::from_body(b"name=x&extra=1&password=y").unwrap();
        assert_eq!(form.user, "x");
        assert_eq!(form.password, "y");
    }

    #[test]
    fn form_without_password_is_rejected() {
        assert!(matches!(
            FormCredentials::from_body(b"user=alice"),
            Err(EmberError::Credential(_))
        ));
        assert!(FormCredentials::from_body(b"").is_err());
    }
}
