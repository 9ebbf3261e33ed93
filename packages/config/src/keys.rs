// ABOUTME: Credential key type and the deduplicating key registry
// ABOUTME: Merges environment-provided keys with command-line overrides in first-seen order

use crate::{ConfigError, Result};
use std::collections::HashSet;
use std::fmt;

/// Number of trailing characters shown when a key is rendered.
const VISIBLE_SUFFIX: usize = 6;

/// An opaque API key authorizing one remote sandbox.
///
/// `Debug` and `Display` only ever show the last few characters so keys can be
/// passed through logging without leaking.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey(String);

impl CredentialKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The full secret, for handing to the gateway.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `…abcdef` style rendering used in log lines.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let start = chars.len().saturating_sub(VISIBLE_SUFFIX);
        format!("…{}", chars[start..].iter().collect::<String>())
    }
}

impl fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CredentialKey").field(&self.masked()).finish()
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Collect the values of every variable whose name starts with `prefix`.
///
/// Variables are ordered by name so the launch order does not depend on how the
/// platform happens to enumerate the environment. Blank values are skipped.
pub fn env_keys<I>(prefix: &str, vars: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut matching: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(name, value)| name.starts_with(prefix) && !value.trim().is_empty())
        .collect();
    matching.sort_by(|a, b| a.0.cmp(&b.0));
    matching.into_iter().map(|(_, value)| value).collect()
}

/// Ordered, duplicate-free set of credential keys. Built once at startup.
#[derive(Debug, Clone)]
pub struct KeyRegistry {
    keys: Vec<CredentialKey>,
}

impl KeyRegistry {
    /// Merge `env` then `overrides`, keeping the first occurrence of each key.
    ///
    /// Keys are stored exactly as given; whitespace only decides whether an entry
    /// is blank. Fails with [`ConfigError::NoKeys`] when nothing usable remains.
    pub fn build(
        env: impl IntoIterator<Item = String>,
        overrides: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();

        for raw in env.into_iter().chain(overrides) {
            if raw.trim().is_empty() {
                continue;
            }
            if seen.insert(raw.clone()) {
                keys.push(CredentialKey::new(raw));
            }
        }

        if keys.is_empty() {
            return Err(ConfigError::NoKeys {
                prefix: crate::constants::E2B_KEY_PREFIX.to_string(),
            });
        }

        tracing::debug!("Key registry built with {} key(s)", keys.len());
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CredentialKey> {
        self.keys.iter()
    }

    pub fn into_keys(self) -> Vec<CredentialKey> {
        self.keys
    }
}
