// src/backend.rs
//! Where user records live. A backend value plays the role of one
//! connection; the pool hands them out to callers one at a time.

use crate::error::{AuthError, AuthResult};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub trait UserBackend: Send {
    /// Every stored (user, credential) pair.
    fn load_all(&mut self) -> AuthResult<Vec<(String, String)>>;

    fn insert(&mut self, user: &str, credential: &str) -> AuthResult<()>;
}

/// Table shared by every connection cloned from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    users: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserBackend for MemoryBackend {
    fn load_all(&mut self) -> AuthResult<Vec<(String, String)>> {
        let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(users.iter().map(|(u, c)| (u.clone(), c.clone())).collect())
    }

    fn insert(&mut self, user: &str, credential: &str) -> AuthResult<()> {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.to_string(), credential.to_string());
        Ok(())
    }
}

/// Flat file of `user<TAB>credential` lines. A missing file is an empty table.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn check_field(kind: &str, value: &str) -> AuthResult<()> {
    if value.is_empty() || value.contains(['\t', '\n', '\r']) {
        return Err(AuthError::Malformed(format!(
            "{} must be non-empty and free of tabs and newlines",
            kind
        )));
    }
    Ok(())
}

impl UserBackend for FileBackend {
    fn load_all(&mut self) -> AuthResult<Vec<(String, String)>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut users = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, credential)) = line.split_once('\t') else {
                return Err(AuthError::Malformed(format!(
                    "{}:{}: expected user<TAB>credential",
                    self.path.display(),
                    n + 1
                )));
            };
            users.push((user.to_string(), credential.to_string()));
        }
        Ok(users)
    }

    fn insert(&mut self, user: &str, credential: &str) -> AuthResult<()> {
        check_field("user name", user)?;
        check_field("credential", credential)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}\t{}", user, credential)?;
        Ok(())
    }
}
