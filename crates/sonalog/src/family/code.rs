//! Family group codes.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Characters a minted code is drawn from.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a family code.
pub const CODE_LENGTH: usize = 6;

fn code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z0-9]{6}$").expect("family code pattern is valid"))
}

/// A validated 6-character family code.
///
/// Codes are case-insensitive on input and always held in uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FamilyCode(String);

impl FamilyCode {
    /// Mint a new random code.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LENGTH)
            .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
            .collect();
        Self(code)
    }

    /// Parse and normalize a user-supplied code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFamilyCode`] unless the trimmed input is six
    /// ASCII letters or digits.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = input.trim().to_ascii_uppercase();
        if code_pattern().is_match(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(Error::InvalidFamilyCode {
                code: input.to_string(),
            })
        }
    }

    /// The code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FamilyCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FamilyCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<FamilyCode> for String {
    fn from(code: FamilyCode) -> Self {
        code.0
    }
}

impl AsRef<str> for FamilyCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
