pub mod password;
pub mod validation;

pub use password::{
    validate_password, CredentialHasher, HashCost, Password, PasswordHashString,
};
pub use validation::normalize_email;
