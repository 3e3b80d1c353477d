//! Content-address descriptors.
//!
//! When present on a path-info record, the descriptor determines the
//! store path (together with the name and references), making the
//! artifact verifiable without any signature.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

use crate::hash::{self, Hash};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// Hash of the file contents as-is. Only valid for a single
    /// regular file.
    Flat,
    /// Hash of the NAR serialization of the tree.
    Recursive,
    /// Git tree-object hashing.
    Git,
    /// Hash of literal text with references; used for derivations.
    Text,
}

impl Method {
    /// The infix used in the `fixed:` rendering, and inside the
    /// `fixed:out:` fingerprint.
    pub fn prefix(&self) -> &'static str {
        match self {
            Method::Flat => "",
            Method::Recursive => "r:",
            Method::Git => "git:",
            Method::Text => "",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentAddress {
    pub method: Method,
    pub hash: Hash,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("missing prefix in content address {0:?}")]
    MissingPrefix(String),
    #[error("unknown content-address kind {0:?}")]
    UnknownKind(String),
    #[error("invalid hash in content address: {0}")]
    InvalidHash(#[from] hash::Error),
}

impl Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method {
            Method::Text => write!(f, "text:{}", self.hash.to_prefixed_base32()),
            m => write!(f, "fixed:{}{}", m.prefix(), self.hash.to_prefixed_base32()),
        }
    }
}

impl FromStr for ContentAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::MissingPrefix(s.to_string()))?;
        match kind {
            "text" => Ok(ContentAddress {
                method: Method::Text,
                hash: Hash::parse_any_prefixed(rest)?,
            }),
            "fixed" => {
                let (method, rest) = if let Some(rest) = rest.strip_prefix("r:") {
                    (Method::Recursive, rest)
                } else if let Some(rest) = rest.strip_prefix("git:") {
                    (Method::Git, rest)
                } else {
                    (Method::Flat, rest)
                };
                Ok(ContentAddress {
                    method,
                    hash: Hash::parse_any_prefixed(rest)?,
                })
            }
            _ => Err(Error::UnknownKind(kind.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use rstest::rstest;

    use crate::hash::{Algo, Hash};

    use super::{ContentAddress, Method};

    #[rstest]
    #[case::nar("fixed:r:sha1:1ak1ymbmsfx7z8kh09jzkr3a4dvkrfjw", Method::Recursive, Algo::Sha1)]
    #[case::flat("fixed:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s", Method::Flat, Algo::Sha256)]
    #[case::git("fixed:git:sha1:1ak1ymbmsfx7z8kh09jzkr3a4dvkrfjw", Method::Git, Algo::Sha1)]
    #[case::text("text:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s", Method::Text, Algo::Sha256)]
    fn roundtrip(#[case] s: &str, #[case] method: Method, #[case] algo: Algo) {
        let ca: ContentAddress = s.parse().unwrap();
        assert_eq!(ca.method, method);
        assert_eq!(ca.hash.algo(), algo);
        assert_eq!(ca.to_string(), s);
    }

    #[test]
    fn sha1_digest_value() {
        let ca: ContentAddress = "fixed:r:sha1:1ak1ymbmsfx7z8kh09jzkr3a4dvkrfjw".parse().unwrap();
        assert_eq!(
            ca.hash,
            Hash::new(Algo::Sha1, hex!("5cba3c77236ae4f9650270a27fbad375551fa60a").to_vec())
                .unwrap()
        );
    }

    #[rstest]
    #[case::no_prefix("sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::unknown("blake3:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::bad_hash("fixed:r:sha256:zz")]
    fn reject(#[case] s: &str) {
        s.parse::<ContentAddress>().unwrap_err();
    }
}
