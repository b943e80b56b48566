// Copyright 2025 The Antler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Commit signing primitives.
//!
//! Ed25519 over the canonical serialization of the unsigned commit record.
//! Public keys travel as OKP JSON Web Keys; signatures as base64 bytes.
//! Verification is deterministic, which is all peers rely on.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer as _;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier as _;
use ed25519_dalek::VerifyingKey;
use rand::RngCore as _;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    /// The signature does not validate against the given public key.
    #[error("Signature verification failed")]
    VerificationFailed,
    #[error("Bad key encoding")]
    BadKey,
    #[error("Bad signature encoding")]
    BadSignature,
}

/// A session's private signing key.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Base64 seed for the settings file. Private; never synced.
    pub fn seed_base64(&self) -> String {
        BASE64.encode(self.signing_key.to_bytes())
    }

    pub fn from_seed_base64(encoded: &str) -> Result<Self, SignError> {
        let bytes = BASE64.decode(encoded).map_err(|_| SignError::BadKey)?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| SignError::BadKey)?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.signing_key.verifying_key(),
        }
    }

    pub fn sign(&self, data: &[u8]) -> SignatureBytes {
        SignatureBytes(self.signing_key.sign(data))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// A session's public verification key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
}

/// JSON Web Key form of a [`PublicKey`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
}

impl PublicKey {
    pub fn verify(&self, data: &[u8], signature: &SignatureBytes) -> Result<(), SignError> {
        self.key
            .verify(data, &signature.0)
            .map_err(|_| SignError::VerificationFailed)
    }

    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            kty: "OKP".to_owned(),
            crv: "Ed25519".to_owned(),
            x: BASE64_URL.encode(self.key.to_bytes()),
        }
    }

    pub fn from_jwk(jwk: &Jwk) -> Result<Self, SignError> {
        if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
            return Err(SignError::BadKey);
        }
        let bytes = BASE64_URL.decode(&jwk.x).map_err(|_| SignError::BadKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| SignError::BadKey)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| SignError::BadKey)?;
        Ok(Self { key })
    }

    /// The JWK as a JSON string, for embedding in session items.
    pub fn to_jwk_string(&self) -> String {
        serde_json::to_string(&self.to_jwk()).unwrap()
    }

    pub fn from_jwk_string(encoded: &str) -> Result<Self, SignError> {
        let jwk: Jwk = serde_json::from_str(encoded).map_err(|_| SignError::BadKey)?;
        Self::from_jwk(&jwk)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&self.to_jwk().x)
            .finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_jwk().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let jwk = Jwk::deserialize(deserializer)?;
        Self::from_jwk(&jwk).map_err(serde::de::Error::custom)
    }
}

/// A detached signature, base64 on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(Signature);

impl SignatureBytes {
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SignError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| SignError::BadSignature)?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| SignError::BadSignature)?;
        Ok(Self(Signature::from_bytes(&bytes)))
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SignatureBytes").field(&self.to_base64()).finish()
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde::Serialize::serialize(&self.to_base64(), serializer)
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded: String = serde::Deserialize::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"payload");
        keypair.public_key().verify(b"payload", &signature).unwrap();
        assert!(
            keypair
                .public_key()
                .verify(b"tampered", &signature)
                .is_err()
        );
    }

    #[test]
    fn test_wrong_key_rejects() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let signature = a.sign(b"payload");
        assert!(b.public_key().verify(b"payload", &signature).is_err());
    }

    #[test]
    fn test_jwk_round_trip() {
        let keypair = Keypair::generate();
        let jwk = keypair.public_key().to_jwk();
        assert_eq!(jwk.kty, "OKP");
        let restored = PublicKey::from_jwk(&jwk).unwrap();
        assert_eq!(restored, keypair.public_key());
    }

    #[test]
    fn test_seed_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_seed_base64(&keypair.seed_base64()).unwrap();
        assert_eq!(restored.public_key(), keypair.public_key());
        let signature = restored.sign(b"x");
        keypair.public_key().verify(b"x", &signature).unwrap();
    }

    #[test]
    fn test_signature_base64_round_trip() {
        let signature = Keypair::generate().sign(b"data");
        let restored = SignatureBytes::from_base64(&signature.to_base64()).unwrap();
        assert_eq!(restored, signature);
    }
}
