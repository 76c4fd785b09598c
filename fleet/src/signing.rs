//! Ed25519 image signing and verification.
//!
//! The release pipeline signs image bytes with [`UpdateSigner`]; the signed
//! digest travels inside the update notification and the agent checks it
//! with [`UpdateVerifier`] before staging.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::errors::FleetError;

/// Signing half of a release keypair
pub struct UpdateSigner {
    key: SigningKey,
}

impl UpdateSigner {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    /// The matching verification half
    pub fn verifier(&self) -> UpdateVerifier {
        UpdateVerifier {
            key: self.key.verifying_key(),
        }
    }

    /// Sign image bytes, returning a base64 signature
    pub fn sign(&self, data: &[u8]) -> String {
        BASE64.encode(self.key.sign(data).to_bytes())
    }
}

/// Verification half distributed to devices
#[derive(Clone)]
pub struct UpdateVerifier {
    key: VerifyingKey,
}

impl UpdateVerifier {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, FleetError> {
        let key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| FleetError::ConfigError(format!("invalid verifying key: {e}")))?;
        Ok(Self { key })
    }

    /// Parse a hex-encoded 32-byte public key (the form stored in settings)
    pub fn from_hex(hex_key: &str) -> Result<Self, FleetError> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| FleetError::ConfigError(format!("invalid verifying key hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FleetError::ConfigError("verifying key must be 32 bytes".to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Verify a base64 signature over `data`
    pub fn verify(&self, data: &[u8], signature_b64: &str) -> Result<(), FleetError> {
        let raw = BASE64
            .decode(signature_b64)
            .map_err(|e| FleetError::SignatureInvalid(format!("bad base64: {e}")))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| FleetError::SignatureInvalid(format!("bad signature bytes: {e}")))?;

        self.key
            .verify(data, &signature)
            .map_err(|e| FleetError::SignatureInvalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signer = UpdateSigner::generate();
        let verifier = signer.verifier();

        let signature = signer.sign(b"firmware image bytes");
        verifier.verify(b"firmware image bytes", &signature).unwrap();
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signer = UpdateSigner::generate();
        let verifier = signer.verifier();

        let signature = signer.sign(b"firmware image bytes");
        let err = verifier.verify(b"tampered bytes", &signature).unwrap_err();
        assert!(matches!(err, FleetError::SignatureInvalid(_)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = UpdateSigner::generate();
        let other = UpdateSigner::generate();

        let signature = signer.sign(b"image");
        assert!(other.verifier().verify(b"image", &signature).is_err());
    }
}
