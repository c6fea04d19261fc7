//! Key material for decrypting push payloads.
//!
//! Generated once per supervisor activation and reused across reconnects, so
//! the backend keeps targeting the same encryption context.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use rand::rngs::OsRng;
use rand::RngCore;

pub const AUTH_SECRET_LEN: usize = 16;

/// P-256 key pair plus the symmetric auth secret.
pub struct KeyMaterial {
    secret_key: SecretKey,
    auth_secret: [u8; AUTH_SECRET_LEN],
}

/// The half of the key material that is sent to the registrar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicEce {
    /// Uncompressed SEC1 point, base64url.
    pub public_key: String,
    pub auth_secret: String,
}

/// The half of the key material the socket client needs to decrypt.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateEce {
    /// Raw 32-byte scalar, base64url.
    pub private_key: String,
    pub auth_secret: String,
}

impl std::fmt::Debug for PrivateEce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateEce").finish_non_exhaustive()
    }
}

impl KeyMaterial {
    pub fn generate() -> Self {
        let secret_key = SecretKey::random(&mut OsRng);
        let mut auth_secret = [0u8; AUTH_SECRET_LEN];
        OsRng.fill_bytes(&mut auth_secret);
        Self {
            secret_key,
            auth_secret,
        }
    }

    pub fn public(&self) -> PublicEce {
        let point = self.secret_key.public_key().to_encoded_point(false);
        PublicEce {
            public_key: BASE64URL.encode(point.as_bytes()),
            auth_secret: BASE64URL.encode(self.auth_secret),
        }
    }

    pub fn private(&self) -> PrivateEce {
        PrivateEce {
            private_key: BASE64URL.encode(self.secret_key.to_bytes().as_slice()),
            auth_secret: BASE64URL.encode(self.auth_secret),
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_key", &self.public().public_key)
            .finish_non_exhaustive()
    }
}
