// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use anyhow::{Context, Result};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

// afl-fuzz rejects -S identifiers longer than 32 bytes. Our ids are
// `<hostname>-xxxx`, so the hostname portion gets at most 32 - 5 bytes.
const MAX_ID_LEN: usize = 32;
const MAX_HOSTNAME_LEN: usize = MAX_ID_LEN - 5;

/// Identifies one fuzzer process within the fleet.
///
/// Ids double as directory names under `output/`, so they only ever contain
/// characters that are safe in a path component.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct FuzzerId(String);

impl FuzzerId {
    /// Builds a fresh id from this machine's hostname and a random 4-char
    /// hex suffix. Collisions across a fleet are possible in principle;
    /// a collision overwrites the peer's output and is operator error.
    pub fn generate() -> Result<Self> {
        let hostname = hostname::get().context("unable to read hostname")?;
        let nonce = thread_rng().gen::<u16>();
        Ok(Self::from_hostname(&hostname.to_string_lossy(), nonce))
    }

    fn from_hostname(hostname: &str, nonce: u16) -> Self {
        let mut name: String = hostname
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => c,
                _ => '_',
            })
            .collect();
        name.truncate(MAX_HOSTNAME_LEN);

        FuzzerId(format!("{}-{:04x}", name, nonce))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FuzzerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Directory names under `output/` are themselves fuzzer ids.
impl From<String> for FuzzerId {
    fn from(id: String) -> Self {
        FuzzerId(id)
    }
}

impl From<&str> for FuzzerId {
    fn from(id: &str) -> Self {
        FuzzerId(id.to_owned())
    }
}

impl AsRef<str> for FuzzerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_sanitizes_hostname() {
        let id = FuzzerId::from_hostname("fuzz box.local", 0xbeef);

        assert_eq!(id.as_str(), "fuzz_box_local-beef");
    }

    #[test]
    fn test_truncates_long_hostname() {
        let hostname = "a".repeat(64);

        let id = FuzzerId::from_hostname(&hostname, 0x1);

        assert_eq!(id.as_str().len(), MAX_ID_LEN);
        assert_eq!(id.as_str(), format!("{}-0001", "a".repeat(27)));
    }

    #[test]
    fn test_generated_ids_fit_engine_limit() {
        let id = FuzzerId::generate().unwrap();

        assert!(id.as_str().len() <= MAX_ID_LEN);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn test_suffix_is_four_hex_chars() {
        let id = FuzzerId::from_hostname("host", 0xa);

        assert_eq!(id.as_str(), "host-000a");
    }
}
