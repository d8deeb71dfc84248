//! `[user@]host[:port]` targets.

use std::fmt;
use std::str::FromStr;

use crate::error::{MuxError, Result};

/// A host to connect to, optionally with its own user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    /// User from `user@`, if given.
    pub user: Option<String>,
    /// Host, including `:port` if given.
    pub host: String,
}

impl HostTarget {
    /// The target's user, or `default`.
    pub fn user_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.user.as_deref().unwrap_or(default)
    }
}

impl FromStr for HostTarget {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (user, host) = match s.rsplit_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, s),
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(MuxError::Configuration(format!("invalid host: {s:?}")));
        }
        if let Some(user) = user {
            if user.is_empty() || user.chars().any(char::is_whitespace) {
                return Err(MuxError::Configuration(format!("invalid user in {s:?}")));
            }
        }

        Ok(Self {
            user: user.map(str::to_string),
            host: host.to_string(),
        })
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{user}@{}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

/// Parses a comma-separated host list. Empty entries are skipped.
pub fn parse_host_list(list: &str) -> Result<Vec<HostTarget>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(HostTarget::from_str)
        .collect()
}
