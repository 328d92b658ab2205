//! Salted one-way password hashing.
//!
//! Hashes are PHC strings (`$pbkdf2-sha256$i=<rounds>,l=32$<salt>$<hash>`),
//! so the iteration count can be raised later without invalidating records
//! already stored. Verification reads the rounds back out of the record.

use pbkdf2::password_hash::{
    PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
};
use pbkdf2::{Algorithm, Params, Pbkdf2};
use rand::RngCore;

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Salt byte length.
const SALT_BYTES: usize = 16;

/// Derived key length (one SHA-256 block).
const OUTPUT_BYTES: usize = 32;

/// PBKDF2-HMAC-SHA256 password hasher.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATIONS)
    }
}

impl PasswordHasher {
    pub fn new(iterations: u32) -> Self {
        Self {
            params: Params {
                rounds: iterations.max(1),
                output_length: OUTPUT_BYTES,
            },
        }
    }

    /// Hash `password` under a freshly generated salt.
    pub fn hash(&self, password: &str) -> Result<String, pbkdf2::password_hash::Error> {
        let salt = generate_salt()?;
        self.derive(password, &salt).map(|h| h.to_string())
    }

    /// Check `password` against a stored PHC string. Unparseable hashes
    /// never verify. The digest comparison is constant-time.
    pub fn verify(&self, password: &str, encoded: &str) -> bool {
        PasswordHash::new(encoded)
            .ok()
            .filter(|parsed| parsed.algorithm == Algorithm::Pbkdf2Sha256.ident())
            .map(|parsed| Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok())
            .unwrap_or(false)
    }

    /// Spend the same derivation cost as [`verify`](Self::verify) without a
    /// stored record, so lookups for unknown users take as long as real ones.
    pub fn dummy_verify(&self, password: &str) {
        if let Ok(salt) = SaltString::encode_b64(&[0u8; SALT_BYTES]) {
            let _ = self.derive(password, &salt);
        }
    }

    fn derive<'a>(
        &self,
        password: &str,
        salt: &'a SaltString,
    ) -> Result<PasswordHash<'a>, pbkdf2::password_hash::Error> {
        Pbkdf2.hash_password_customized(
            password.as_bytes(),
            Some(Algorithm::Pbkdf2Sha256.ident()),
            None,
            self.params,
            salt,
        )
    }
}

fn generate_salt() -> Result<SaltString, pbkdf2::password_hash::Error> {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    SaltString::encode_b64(&bytes)
}
