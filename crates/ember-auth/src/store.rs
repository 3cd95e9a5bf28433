// src/store.rs
use crate::backend::UserBackend;
use crate::error::AuthResult;
use crate::password::{hash_password, verify_password};
use crate::pool::ConnPool;
use ember_core::{CredentialStore, EmberResult};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Credential store backed by a pool of user-backend connections.
///
/// Every user is loaded into memory once at construction; lookups never touch
/// the backend. Registrations are written through a pooled connection and then
/// cached, all under the cache's write lock so two registrations of the same
/// name cannot both succeed.
pub struct UserStore<B: UserBackend> {
    pool: ConnPool<B>,
    cache: RwLock<HashMap<String, String>>,
    checkout_timeout: Duration,
}

impl<B: UserBackend> UserStore<B> {
    pub fn new(pool: ConnPool<B>) -> AuthResult<Self> {
        let users = pool.get_timeout(CHECKOUT_TIMEOUT)?.load_all()?;
        info!(users = users.len(), pool = pool.size(), "user store loaded");
        Ok(Self {
            pool,
            cache: RwLock::new(users.into_iter().collect()),
            checkout_timeout: CHECKOUT_TIMEOUT,
        })
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pool(&self) -> &ConnPool<B> {
        &self.pool
    }

    fn register(&self, user: &str, password: &str) -> AuthResult<bool> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.contains_key(user) {
            return Ok(false);
        }
        let hash = hash_password(password)?;
        self.pool
            .get_timeout(self.checkout_timeout)?
            .insert(user, &hash)?;
        cache.insert(user.to_string(), hash);
        debug!("Registered user {:?}", user);
        Ok(true)
    }
}

impl<B: UserBackend> CredentialStore for UserStore<B> {
    fn lookup(&self, user: &str) -> EmberResult<Option<String>> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.get(user).cloned())
    }

    fn insert(&self, user: &str, password: &str) -> EmberResult<bool> {
        Ok(self.register(user, password)?)
    }

    fn verify(&self, user: &str, password: &str) -> EmberResult<bool> {
        match self.lookup(user)? {
            Some(hash) => Ok(verify_password(password, &hash)?),
            None => Ok(false),
        }
    }
}
