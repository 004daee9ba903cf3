//! Encryption at rest for provider tokens and authenticator secrets, plus
//! the random material the auth flows hand out.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, Rng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 with a process-wide key. Output is `nonce || ciphertext`.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Key from standard base64 of exactly 32 bytes.
    pub fn from_base64(encoded: &SecretString) -> Result<Self, anyhow::Error> {
        let bytes = STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|e| anyhow::anyhow!("SECRET_ENCRYPTION_KEY is not valid base64: {}", e))?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            anyhow::anyhow!("SECRET_ENCRYPTION_KEY must be 32 bytes, got {}", b.len())
        })?;
        Ok(Self::new(key))
    }

    /// Throwaway key; data sealed with it does not survive a restart.
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    #[allow(deprecated)]
    pub fn seal(&self, plaintext: &[u8], aad: &str) -> Result<Vec<u8>, anyhow::Error> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| anyhow::anyhow!("Encryption failure: {e}"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    #[allow(deprecated)]
    pub fn open(&self, sealed: &[u8], aad: &str) -> Result<Vec<u8>, anyhow::Error> {
        if sealed.len() < NONCE_LEN {
            anyhow::bail!("Invalid ciphertext length");
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| anyhow::anyhow!("Decryption failure: {e}"))
    }

    pub fn seal_str(&self, plaintext: &str, aad: &str) -> Result<Vec<u8>, anyhow::Error> {
        self.seal(plaintext.as_bytes(), aad)
    }

    pub fn open_str(&self, sealed: &[u8], aad: &str) -> Result<String, anyhow::Error> {
        String::from_utf8(self.open(sealed, aad)?)
            .map_err(|e| anyhow::anyhow!("Decrypted value is not UTF-8: {}", e))
    }
}

pub fn provider_token_aad(user_id: Uuid, provider: &str, kind: &str) -> String {
    format!("oauth-token:v1|{user_id}|{provider}|{kind}")
}

pub fn totp_secret_aad(user_id: Uuid) -> String {
    format!("totp-secret:v1|{user_id}")
}

/// 32 random bytes, base64url without padding. Used for every opaque token.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Zero-padded decimal code of `digits` length.
pub fn numeric_code(digits: u32) -> String {
    let bound = 10u64.pow(digits);
    let value = OsRng.gen_range(0..bound);
    format!("{:0width$}", value, width = digits as usize)
}
