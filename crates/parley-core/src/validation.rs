use regex::Regex;
use std::sync::OnceLock;

use crate::error::ServiceError;

pub const MAX_MESSAGE_CHARS: usize = 4000;
pub const MAX_NAME_CHARS: usize = 64;
pub const MAX_BIO_CHARS: usize = 500;

/// Trims and lowercases, then checks the shape of the address.
pub fn normalize_email(raw: &str) -> Result<String, ServiceError> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(ServiceError::validation("email is required"));
    }
    if email.len() > 254 {
        return Err(ServiceError::validation("email must be at most 254 characters"));
    }

    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").expect("Failed to compile email regex")
    });

    if !regex.is_match(&email) {
        return Err(ServiceError::validation("invalid email format"));
    }
    Ok(email)
}

/// Display name given to a user created by their first sign-in.
pub fn placeholder_name(email: &str) -> String {
    let local = email.split('@').next().unwrap_or(email);
    local.chars().take(8).collect()
}

pub fn is_six_digit_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

pub fn check_name(name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::validation("name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(ServiceError::validation(format!(
            "name must be at most {MAX_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

pub fn check_bio(bio: &str) -> Result<String, ServiceError> {
    let bio = bio.trim();
    if bio.chars().count() > MAX_BIO_CHARS {
        return Err(ServiceError::validation(format!(
            "bio must be at most {MAX_BIO_CHARS} characters"
        )));
    }
    Ok(bio.to_string())
}
