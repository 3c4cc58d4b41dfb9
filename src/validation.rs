//! Input validation for identifiers, scanned codes and account credentials.
//!
//! Everything here runs before a mutation is attempted; a rejected input never
//! touches the quest or player stores.

use std::fmt::Write;

/// Validation errors with helpful messages
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{kind} is empty")]
    Empty { kind: IdentifierKind },

    #[error("{kind} is too long (maximum {max} characters)")]
    TooLong { kind: IdentifierKind, max: usize },

    #[error("{kind} contains invalid characters: {chars}")]
    InvalidCharacters { kind: IdentifierKind, chars: String },

    #[error("email address is malformed")]
    InvalidEmail,

    #[error("password is too short (minimum {min} characters)")]
    PasswordTooShort { min: usize },

    #[error("password must contain at least one letter and one digit")]
    PasswordTooWeak,

    #[error("coordinates out of range: ({lat}, {lng})")]
    InvalidCoordinates { lat: f64, lng: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Quest,
    Step,
    Item,
    Point,
    Skill,
    Flag,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IdentifierKind::Quest => "quest id",
            IdentifierKind::Step => "quest step",
            IdentifierKind::Item => "item id",
            IdentifierKind::Point => "point key",
            IdentifierKind::Skill => "skill key",
            IdentifierKind::Flag => "flag",
        };
        f.write_str(name)
    }
}

pub const MAX_IDENTIFIER_LENGTH: usize = 64;
pub const MAX_STEP_LENGTH: usize = 128;
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Validate an identifier: 1..=64 chars of `[a-z0-9_-]`. Returns it unchanged on success.
pub fn validate_identifier(kind: IdentifierKind, value: &str) -> Result<&str, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { kind });
    }
    if value.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong {
            kind,
            max: MAX_IDENTIFIER_LENGTH,
        });
    }

    let mut invalid: Vec<char> = value
        .chars()
        .filter(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
        .collect();
    if !invalid.is_empty() {
        invalid.sort_unstable();
        invalid.dedup();
        return Err(ValidationError::InvalidCharacters {
            kind,
            chars: escape_for_log(&invalid.into_iter().collect::<String>()),
        });
    }
    Ok(value)
}

/// Validate a quest step the caller wants to set explicitly (not via completion).
///
/// Step labels are free-form text chosen by quest authors; only blank and oversized
/// labels are rejected.
pub fn validate_step(step: &str) -> Result<&str, ValidationError> {
    if step.trim().is_empty() {
        return Err(ValidationError::Empty {
            kind: IdentifierKind::Step,
        });
    }
    if step.chars().count() > MAX_STEP_LENGTH {
        return Err(ValidationError::TooLong {
            kind: IdentifierKind::Step,
            max: MAX_STEP_LENGTH,
        });
    }
    Ok(step)
}

/// Normalize a raw scanned payload into a point key.
///
/// Surrounding whitespace is trimmed, an optional deep-link `prefix` is stripped, and
/// the remainder is lowercased before being validated as a point key.
pub fn normalize_scan_code(raw: &str, prefix: Option<&str>) -> Result<String, ValidationError> {
    let mut code = raw.trim();
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        if let Some(rest) = code.strip_prefix(prefix) {
            code = rest;
        }
    }
    let code = code.trim_matches('/').to_ascii_lowercase();
    validate_identifier(IdentifierKind::Point, &code)?;
    Ok(code)
}

/// Reject coordinates that are not finite decimal degrees in range.
pub fn validate_coordinates(lat: f64, lng: f64) -> Result<(), ValidationError> {
    let ok = lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng);
    if !ok {
        return Err(ValidationError::InvalidCoordinates { lat, lng });
    }
    Ok(())
}

/// Basic structural email check: one `@`, non-empty local part, dotted domain.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ValidationError::InvalidEmail);
    };
    let domain_ok = !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..");
    if local.is_empty() || !domain_ok || email.chars().any(|c| c.is_whitespace()) {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::PasswordTooShort {
            min: MIN_PASSWORD_LENGTH,
        });
    }
    let has_letter = password.chars().any(char::is_alphabetic);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_letter && has_digit) {
        return Err(ValidationError::PasswordTooWeak);
    }
    Ok(())
}

/// Escape a string for single-line logging and cap its length.
///
/// Scanned payloads come from arbitrary QR codes; newlines and control characters in
/// them would otherwise break log lines.
pub fn escape_for_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 120;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
