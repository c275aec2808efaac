//! Basic authorization against a password file
//!
//! The user table is loaded once at route-registration time and shared
//! immutably, so checks on the request path touch no locks.

use std::collections::HashMap;
use std::path::Path;

use base64ct::{Base64, Encoding};

/// Credentials from a `Basic` Authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    /// Parse an `Authorization: Basic <base64(user:password)>` value.
    pub fn parse(header: &[u8]) -> Option<Self> {
        let header = std::str::from_utf8(header).ok()?;
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = Base64::decode_vec(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;

        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Realm plus user table backing the dispatch authorization gate.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    realm: String,
    users: HashMap<String, String>,
}

impl BasicAuth {
    pub fn new(realm: impl Into<String>, users: HashMap<String, String>) -> Self {
        Self {
            realm: realm.into(),
            users,
        }
    }

    /// Load a `user = password` file, one entry per line; `#` starts a
    /// comment.
    pub fn from_password_file(realm: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut users = HashMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((user, password)) = line.split_once('=') {
                users.insert(user.trim().to_string(), password.trim().to_string());
            }
        }

        Ok(Self::new(realm, users))
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Check a raw Authorization header value against the user table.
    pub fn check(&self, authorization: &[u8]) -> bool {
        let Some(credentials) = BasicCredentials::parse(authorization) else {
            return false;
        };
        self.users
            .get(&credentials.username)
            .is_some_and(|password| *password == credentials.password)
    }
}
