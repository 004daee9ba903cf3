use validator::ValidateEmail;

const MAX_EMAIL_LENGTH: usize = 254;

/// Trim and lowercase an email, then check its shape.
pub fn normalize_email(raw: &str) -> Result<String, String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err("email is required".to_string());
    }
    if email.len() > MAX_EMAIL_LENGTH || !email.validate_email() {
        return Err("email is not a valid address".to_string());
    }
    Ok(email)
}
