use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

pub const MIN_PASSWORD_LENGTH: usize = 12;
pub const MAX_PASSWORD_LENGTH: usize = 128;

const WEAK_PATTERNS: [&str; 4] = ["password", "qwerty", "123456", "letmein"];

/// Newtype for password to prevent accidental logging
#[derive(Clone, Default)]
pub struct Password(String);

impl Password {
    pub fn new(password: String) -> Self {
        Self(password)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Newtype for password hash
#[derive(Debug, Clone)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

/// Argon2id hasher with a fixed cost. Also keeps a dummy hash so failure paths
/// that have no real hash to check still pay for one verification.
#[derive(Clone)]
pub struct CredentialHasher {
    argon2: Argon2<'static>,
    dummy_hash: PasswordHashString,
}

impl CredentialHasher {
    pub fn new(cost: HashCost) -> Result<Self, anyhow::Error> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| anyhow::anyhow!("Invalid Argon2 parameters: {}", e))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut hasher = Self {
            argon2,
            dummy_hash: PasswordHashString::new(String::new()),
        };
        hasher.dummy_hash = hasher.hash(&Password::new(crate::services::crypto::random_token()))?;
        Ok(hasher)
    }

    /// Salt is generated per call and embedded in the PHC string.
    pub fn hash(&self, password: &Password) -> Result<PasswordHashString, anyhow::Error> {
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2
            .hash_password(password.as_str().as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
            .to_string();

        Ok(PasswordHashString::new(password_hash))
    }

    /// Constant-time check. Parameters are read from the stored hash.
    pub fn verify(
        &self,
        password: &Password,
        password_hash: &PasswordHashString,
    ) -> Result<(), anyhow::Error> {
        let parsed_hash = PasswordHash::new(password_hash.as_str())
            .map_err(|e| anyhow::anyhow!("Invalid password hash format: {}", e))?;

        self.argon2
            .verify_password(password.as_str().as_bytes(), &parsed_hash)
            .map_err(|_| anyhow::anyhow!("Password verification failed"))
    }

    /// Spend one verification against the dummy hash; the result is discarded.
    pub fn verify_dummy(&self, password: &Password) {
        let _ = self.verify(password, &self.dummy_hash);
    }
}

/// Check a new password against the strength policy.
pub fn validate_password(password: &str) -> Result<(), String> {
    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        ));
    }
    if length > MAX_PASSWORD_LENGTH {
        return Err(format!(
            "password must be at most {} characters",
            MAX_PASSWORD_LENGTH
        ));
    }

    if !password.chars().any(|c| c.is_uppercase()) {
        return Err("password must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Err("password must contain a lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("password must contain a digit".to_string());
    }
    if !password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        return Err("password must contain a symbol".to_string());
    }

    let lowered = password.to_lowercase();
    if WEAK_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Err("password contains a common pattern".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_hasher() -> CredentialHasher {
        CredentialHasher::new(HashCost {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .expect("Failed to build hasher")
    }

    #[test]
    fn test_hash_password() {
        let password = Password::new("mySecurePassword123".to_string());
        let hash = fast_hasher().hash(&password).expect("Failed to hash password");

        // Hash should start with $argon2id
        assert!(hash.as_str().starts_with("$argon2id"));
    }

    #[test]
    fn test_verify_password_correct_and_incorrect() {
        let hasher = fast_hasher();
        let password = Password::new("mySecurePassword123".to_string());
        let hash = hasher.hash(&password).expect("Failed to hash password");

        assert!(hasher.verify(&password, &hash).is_ok());

        let wrong_password = Password::new("wrongPassword".to_string());
        assert!(hasher.verify(&wrong_password, &hash).is_err());
    }

    #[test]
    fn test_different_hashes_for_same_password() {
        let hasher = fast_hasher();
        let password = Password::new("mySecurePassword123".to_string());
        let hash1 = hasher.hash(&password).expect("Failed to hash password");
        let hash2 = hasher.hash(&password).expect("Failed to hash password");

        // Same password should produce different hashes (due to random salt)
        assert_ne!(hash1.as_str(), hash2.as_str());
        assert!(hasher.verify(&password, &hash1).is_ok());
        assert!(hasher.verify(&password, &hash2).is_ok());
    }

    #[test]
    fn test_hash_from_other_cost_still_verifies() {
        let password = Password::new("mySecurePassword123".to_string());
        let strong = CredentialHasher::new(HashCost {
            memory_kib: 2048,
            iterations: 2,
            parallelism: 1,
        })
        .unwrap();
        let hash = strong.hash(&password).unwrap();
        assert!(fast_hasher().verify(&password, &hash).is_ok());
    }

    #[test]
    fn test_password_debug_is_redacted() {
        let password = Password::new("StrongPass123!".to_string());
        assert_eq!(format!("{:?}", password), "Password(***)");
    }

    #[test]
    fn test_length_boundaries() {
        let base = "Aa1!";
        let of_len = |n: usize| format!("{}{}", base, "x".repeat(n - base.len()));

        assert!(validate_password(&of_len(11)).is_err());
        assert!(validate_password(&of_len(12)).is_ok());
        assert!(validate_password(&of_len(128)).is_ok());
        assert!(validate_password(&of_len(129)).is_err());
    }

    #[test]
    fn test_character_classes_and_blocklist() {
        assert!(validate_password("StrongPass123!").is_ok());
        assert!(validate_password("strongpass123!").is_err());
        assert!(validate_password("STRONGPASS123!").is_err());
        assert!(validate_password("StrongPassword!").is_err());
        assert!(validate_password("StrongPass1234").is_err());
        assert!(validate_password("MyPassword123!").is_err());
        assert!(validate_password("Qwerty!Strong9").is_err());
    }
}
