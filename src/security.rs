//! Credential obfuscation helpers.
//!
//! Stored secrets (the chat bot token) are kept as
//! `base64(base64(utf8(secret)))`. This is obfuscation against casual
//! inspection of config files, not security.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{Error, Result};

/// Obfuscate a secret for storage in a config file.
pub fn encode(value: &str) -> String {
    STANDARD.encode(STANDARD.encode(value.as_bytes()))
}

/// Recover a secret stored with [`encode`].
pub fn decode(value: &str) -> Result<String> {
    let outer = STANDARD
        .decode(value.trim())
        .map_err(|e| Error::Decode(format!("outer base64: {e}")))?;
    let inner = STANDARD
        .decode(outer)
        .map_err(|e| Error::Decode(format!("inner base64: {e}")))?;
    String::from_utf8(inner).map_err(|e| Error::Decode(format!("not utf-8: {e}")))
}
