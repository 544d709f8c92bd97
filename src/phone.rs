//! Identifier normalization.
//!
//! Canonicalizes user-supplied phone numbers into digits-only international
//! form. Pure string validation; no I/O, no side effects.

use crate::error::PhoneError;

/// Minimum digit count for a plausible international number.
pub const MIN_DIGITS: usize = 10;

/// Maximum digit count per E.164.
pub const MAX_DIGITS: usize = 15;

/// Normalize a free-form phone number into canonical digits-only form.
///
/// Strips a leading `+` and common separators (spaces, dashes, dots,
/// parentheses), then validates that only digits remain and that the digit
/// count is within [`MIN_DIGITS`]..=[`MAX_DIGITS`]. Idempotent: normalizing
/// an already-normalized number returns the same value.
pub fn normalize(input: &str) -> Result<String, PhoneError> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let cleaned: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    if cleaned.is_empty() {
        return Err(PhoneError::Empty);
    }
    if !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(PhoneError::NotNumeric {
            input: input.to_string(),
        });
    }
    if cleaned.starts_with('0') {
        return Err(PhoneError::LeadingZero);
    }

    let digits = cleaned.len();
    if digits < MIN_DIGITS {
        return Err(PhoneError::TooShort {
            digits,
            min: MIN_DIGITS,
        });
    }
    if digits > MAX_DIGITS {
        return Err(PhoneError::TooLong {
            digits,
            max: MAX_DIGITS,
        });
    }

    Ok(cleaned)
}
