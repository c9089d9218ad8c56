use validator::ValidateEmail;

pub const MAX_SOURCE_IDENTIFIER_LEN: usize = 2048;

/// Validates that the input looks like a valid email address
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    !email.is_empty() && email.validate_email()
}

/// Source identifiers are video ids, file names or URLs: free text, but bounded.
pub fn is_valid_source_identifier(identifier: &str) -> bool {
    !identifier.trim().is_empty()
        && identifier.len() <= MAX_SOURCE_IDENTIFIER_LEN
        && !identifier.chars().any(|c| c.is_control())
}
