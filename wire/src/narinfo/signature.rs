//! Detached signatures as they appear on `Sig:` lines and in the
//! valid-paths database: `{key-name}:{base64 ed25519 signature}`.

use std::fmt::{self, Display};

use data_encoding::BASE64;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    name: String,
    bytes: [u8; 64],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing separator")]
    MissingSeparator,
    #[error("invalid signature length {0}")]
    InvalidLength(usize),
    #[error("unable to base64-decode signature {0:?}")]
    DecodeError(String),
}

impl Signature {
    pub fn new(name: impl Into<String>, bytes: [u8; 64]) -> Self {
        Signature {
            name: name.into(),
            bytes,
        }
    }

    pub fn parse(input: &str) -> Result<Self, SignatureError> {
        let (name, bytes64) = input
            .split_once(':')
            .ok_or(SignatureError::MissingSeparator)?;

        let mut buf = [0u8; 66];
        match BASE64.decode_mut(bytes64.as_bytes(), &mut buf) {
            Ok(64) => {
                let mut bytes = [0u8; 64];
                bytes.copy_from_slice(&buf[..64]);
                Ok(Signature {
                    name: name.to_string(),
                    bytes,
                })
            }
            Ok(n) => Err(SignatureError::InvalidLength(n)),
            Err(_) => Err(SignatureError::DecodeError(input.to_string())),
        }
    }

    /// Name of the key that (claims to have) produced this signature.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    pub fn verify(&self, fingerprint: &[u8], verifying_key: &ed25519_dalek::VerifyingKey) -> bool {
        let sig = ed25519::Signature::from_bytes(&self.bytes);
        verifying_key.verify_strict(fingerprint, &sig).is_ok()
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, BASE64.encode(&self.bytes))
    }
}

impl std::str::FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signature::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::Signature;

    const SIG: &str = "cache.nixos.org-1:TsTTb3WGTZKphvYdBHXwo6weVILmTytUjLB+vcX89fOjjRicCHmKA4RCPMVLkj6TMJ4GMX3HPVWRdD1hkeKZBQ==";

    #[test]
    fn roundtrip() {
        let sig = Signature::parse(SIG).unwrap();
        assert_eq!(sig.name(), "cache.nixos.org-1");
        assert_eq!(sig.to_string(), SIG);
    }

    #[rstest]
    #[case::no_separator("TsTTb3WGTZKphvYdBHXwo6weVILmTytUjLB+vcX89fOjjRicCHmKA4RCPMVLkj6TMJ4GMX3HPVWRdD1hkeKZBQ==")]
    #[case::too_short("test1:TsTTb3WG")]
    #[case::not_base64("test1:!!!!b3WGTZKphvYdBHXwo6weVILmTytUjLB+vcX89fOjjRicCHmKA4RCPMVLkj6TMJ4GMX3HPVWRdD1hkeKZBQ==")]
    fn reject(#[case] input: &str) {
        Signature::parse(input).unwrap_err();
    }
}
