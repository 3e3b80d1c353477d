//! Key material for signing and verifying path-info fingerprints.
//!
//! Secret keys use the format produced by
//! `generate-binary-cache-key`: `{name}:{base64(seed ++ pubkey)}`.
//! Public keys are `{name}:{base64(pubkey)}` as listed in the
//! `trusted-public-keys` setting.

use std::fmt::{self, Display};

use data_encoding::BASE64;
use ed25519_dalek::{Signer, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use thiserror::Error;

use super::signature::Signature;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("missing separator")]
    MissingSeparator,
    #[error("invalid key name {0:?}")]
    InvalidName(String),
    #[error("invalid key length {0}")]
    InvalidLength(usize),
    #[error("unable to base64-decode key")]
    DecodeError,
    #[error("invalid verifying key: {0}")]
    InvalidVerifyingKey(ed25519_dalek::SignatureError),
}

fn validate_key_name(name: &str) -> Result<(), KeyError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '.')
    {
        return Err(KeyError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A named ed25519 signing key.
#[derive(Debug)]
pub struct SigningKey {
    name: String,
    key: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Parse the `{name}:{base64(seed ++ pubkey)}` secret key format.
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        let (name, bytes64) = input.split_once(':').ok_or(KeyError::MissingSeparator)?;
        validate_key_name(name)?;

        const LEN: usize = SECRET_KEY_LENGTH + PUBLIC_KEY_LENGTH;
        let mut buf = [0u8; LEN + 2];
        match BASE64.decode_mut(bytes64.as_bytes(), &mut buf) {
            Ok(LEN) => {}
            Ok(n) => return Err(KeyError::InvalidLength(n)),
            Err(_) => return Err(KeyError::DecodeError),
        }

        let seed: [u8; SECRET_KEY_LENGTH] = buf[..SECRET_KEY_LENGTH].try_into().unwrap();
        Ok(SigningKey {
            name: name.to_string(),
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sign a fingerprint, producing a [Signature] carrying this key's
    /// name.
    pub fn sign(&self, fingerprint: &[u8]) -> Signature {
        Signature::new(self.name.clone(), self.key.sign(fingerprint).to_bytes())
    }

    /// The verifying half, for `require-sigs` setups that trust their
    /// own keys.
    pub fn to_verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            name: self.name.clone(),
            key: self.key.verifying_key(),
        }
    }
}

/// A named ed25519 public key from the trust set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    name: String,
    key: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        let (name, bytes64) = input.split_once(':').ok_or(KeyError::MissingSeparator)?;
        validate_key_name(name)?;

        let mut buf = [0u8; PUBLIC_KEY_LENGTH + 1];
        match BASE64.decode_mut(bytes64.as_bytes(), &mut buf) {
            Ok(PUBLIC_KEY_LENGTH) => {}
            Ok(n) => return Err(KeyError::InvalidLength(n)),
            Err(_) => return Err(KeyError::DecodeError),
        }

        let bytes: [u8; PUBLIC_KEY_LENGTH] = buf[..PUBLIC_KEY_LENGTH].try_into().unwrap();
        Ok(VerifyingKey {
            name: name.to_string(),
            key: ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                .map_err(KeyError::InvalidVerifyingKey)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff `signature` carries this key's name and validates the
    /// fingerprint under this key.
    pub fn verify(&self, fingerprint: &str, signature: &Signature) -> bool {
        self.name == signature.name() && signature.verify(fingerprint.as_bytes(), &self.key)
    }
}

impl Display for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, BASE64.encode(self.key.as_bytes()))
    }
}
