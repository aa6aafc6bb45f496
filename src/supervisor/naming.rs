//! Reversible mapping between session identifiers and instance names.
//!
//! An instance name is `<prefix>-<encoded id>`. ASCII alphanumerics and
//! `-` pass through unchanged; every other byte, `_` included, becomes
//! `_xx` in lowercase hex. Because `_` is always an escape, the encoding
//! is injective and [`UnitNaming::session_id`] recovers the original id.

use std::fmt::Write as _;

/// Suffix the service manager appends to unit names.
pub const UNIT_SUFFIX: &str = ".service";

/// Instance naming convention for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitNaming {
    prefix: String,
}

impl UnitNaming {
    /// Build a naming convention around `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Shared prefix of every instance.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Instance name for `session_id`.
    #[must_use]
    pub fn instance_name(&self, session_id: &str) -> String {
        format!("{}-{}", self.prefix, encode(session_id))
    }

    /// Recover the session id from an instance name.
    ///
    /// Accepts names with or without the `.service` suffix. Returns `None`
    /// for names outside this convention.
    #[must_use]
    pub fn session_id(&self, instance: &str) -> Option<String> {
        let name = instance.strip_suffix(UNIT_SUFFIX).unwrap_or(instance);
        let encoded = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        if encoded.is_empty() {
            return None;
        }
        decode(encoded)
    }
}

/// Encode an arbitrary identifier into the safe alphabet.
#[must_use]
pub fn encode(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "_{byte:02x}");
        }
    }
    out
}

/// Reverse [`encode`]. Returns `None` on malformed input.
#[must_use]
pub fn decode(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let hex = encoded.get(i + 1..i + 3)?;
                if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
                    return None;
                }
                let byte = u8::from_str_radix(hex, 16).ok()?;
                // Bytes that never get escaped must not appear escaped.
                if byte.is_ascii_alphanumeric() || byte == b'-' {
                    return None;
                }
                out.push(byte);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'-' => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}
