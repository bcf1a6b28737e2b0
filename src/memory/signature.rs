//! Byte-pattern signatures with `??` wildcards.
//!
//! A signature is written as whitespace-separated tokens, each either a
//! two-digit hex byte or `??`:
//!
//! ```text
//! 80 3d ?? ?? ?? ?? ?? 74 ??
//! ```
//!
//! It matches any contiguous byte run where every non-wildcard token equals
//! the byte at the same position.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use super::address::RelativeAddress;
use crate::{AppError, Result};

/// Parsed signature: one `Option<u8>` per token, `None` for a wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    tokens: Vec<Option<u8>>,
}

impl Signature {
    /// Parse a signature.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] for an empty signature, a signature of
    /// only wildcards, or any token that is neither `??` nor a hex byte.
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        for token in text.split_whitespace() {
            if token == "??" || token == "?" {
                tokens.push(None);
                continue;
            }
            if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(AppError::Config(format!(
                    "invalid signature token '{token}' in '{text}'"
                )));
            }
            let byte = u8::from_str_radix(token, 16).map_err(|_| {
                AppError::Config(format!("invalid signature token '{token}' in '{text}'"))
            })?;
            tokens.push(Some(byte));
        }

        if tokens.iter().all(Option::is_none) {
            return Err(AppError::Config(format!(
                "signature '{text}' has no concrete bytes"
            )));
        }
        Ok(Self { tokens })
    }

    /// Number of bytes the signature spans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always `false` for a parsed signature; present for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Whether the signature matches `window` (which must be exactly
    /// [`len`](Self::len) bytes).
    #[must_use]
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.tokens.len()
            && self
                .tokens
                .iter()
                .zip(window)
                .all(|(token, byte)| match token {
                    Some(expected) => expected == byte,
                    None => true,
                })
    }

    /// First offset in `haystack` where the signature matches.
    #[must_use]
    pub fn find_in(&self, haystack: &[u8]) -> Option<RelativeAddress> {
        if haystack.len() < self.tokens.len() {
            return None;
        }

        // Anchor on the first concrete byte to skip most windows cheaply.
        let (anchor_pos, anchor) = self
            .tokens
            .iter()
            .enumerate()
            .find_map(|(i, t)| t.map(|b| (i, b)))?;

        let last_start = haystack.len() - self.tokens.len();
        let mut start = 0;
        while start <= last_start {
            let probe = &haystack[start + anchor_pos..=last_start + anchor_pos];
            let Some(hit) = probe.iter().position(|b| *b == anchor) else {
                return None;
            };
            start += hit;
            if self.matches(&haystack[start..start + self.tokens.len()]) {
                return Some(RelativeAddress(start as u64));
            }
            start += 1;
        }
        None
    }
}

impl FromStr for Signature {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for token in &self.tokens {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match token {
                Some(byte) => write!(f, "{byte:02x}")?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}
