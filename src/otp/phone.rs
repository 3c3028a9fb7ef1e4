//! Phone and purpose normalization for OTP keys.
//!
//! Normalization is total: it returns a canonical digit string or a
//! rejection, never a partially normalized value.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{AppError, ValidationError};

/// Uzbekistan country calling code.
pub const COUNTRY_CODE: &str = "998";
const NATIONAL_DIGITS: usize = 9;

static PURPOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,31}$").expect("static regex"));

/// Canonical phone: digits only, country code prefixed (e.g. `998901234567`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        normalize_phone(raw).ok_or_else(|| {
            AppError::validation(ValidationError::InvalidPhone {
                phone: raw.to_string(),
            })
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scope tag for an OTP (`login`, `password_reset`, `checkout`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OtpPurpose(String);

impl OtpPurpose {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let candidate = raw.trim().to_lowercase();
        if PURPOSE_RE.is_match(&candidate) {
            Ok(Self(candidate))
        } else {
            Err(AppError::validation(ValidationError::InvalidPurpose {
                purpose: raw.to_string(),
            }))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OtpPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts `+998 90 123-45-67`, `998901234567`, `90 123 45 67` and similar.
/// Separators allowed: spaces, dashes, dots, parentheses and one leading `+`.
pub fn normalize_phone(raw: &str) -> Option<PhoneNumber> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let mut digits = String::with_capacity(body.len());
    for c in body.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return None,
        }
    }

    let canonical = match digits.len() {
        NATIONAL_DIGITS => format!("{}{}", COUNTRY_CODE, digits),
        n if n == NATIONAL_DIGITS + COUNTRY_CODE.len() && digits.starts_with(COUNTRY_CODE) => {
            digits
        }
        _ => return None,
    };

    Some(PhoneNumber(canonical))
}
