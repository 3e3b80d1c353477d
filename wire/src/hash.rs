//! Cryptographic digests and their textual forms.
//!
//! A digest can be rendered and parsed in base-16, base-32 (the custom
//! alphabet from [crate::base32]), base-64, and SRI form. Parsing is
//! tolerant: given an expected algorithm, any of the encodings is
//! recognized by its length.

use std::fmt::{self, Display};
use std::io::{self, Write};
use std::str::FromStr;

use data_encoding::{BASE64, HEXLOWER};
use digest::Digest;
use thiserror::Error;

use crate::base32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl Algo {
    pub fn digest_len(&self) -> usize {
        match self {
            Algo::Md5 => 16,
            Algo::Sha1 => 20,
            Algo::Sha256 => 32,
            Algo::Sha512 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algo::Md5 => "md5",
            Algo::Sha1 => "sha1",
            Algo::Sha256 => "sha256",
            Algo::Sha512 => "sha512",
        }
    }
}

impl Display for Algo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(Algo::Md5),
            "sha1" => Ok(Algo::Sha1),
            "sha256" => Ok(Algo::Sha256),
            "sha512" => Ok(Algo::Sha512),
            _ => Err(Error::UnknownAlgo(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown hash algorithm {0:?}")]
    UnknownAlgo(String),
    #[error("hash {0:?} has no algorithm prefix and none was expected from context")]
    MissingAlgo(String),
    #[error("hash {0:?} specifies algorithm {1}, expected {2}")]
    AlgoMismatch(String, Algo, Algo),
    #[error("length {0} matches no encoding of a {1} digest")]
    WrongLength(usize, Algo),
    #[error("invalid base-16 digest: {0}")]
    InvalidBase16(String),
    #[error("invalid base-32 digest: {0}")]
    InvalidBase32(base32::DecodeError),
    #[error("invalid base-64 digest: {0}")]
    InvalidBase64(String),
}

/// A digest tagged with its algorithm.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash {
    algo: Algo,
    digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: Algo, digest: Vec<u8>) -> Result<Self, Error> {
        if digest.len() != algo.digest_len() {
            return Err(Error::WrongLength(digest.len(), algo));
        }
        Ok(Hash { algo, digest })
    }

    pub fn sha256(digest: [u8; 32]) -> Self {
        Hash {
            algo: Algo::Sha256,
            digest: digest.to_vec(),
        }
    }

    pub fn algo(&self) -> Algo {
        self.algo
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// The digest as a fixed-size array; fails if the algorithm's
    /// digest length differs from `N`.
    pub fn digest_fixed<const N: usize>(&self) -> Option<[u8; N]> {
        self.digest.as_slice().try_into().ok()
    }

    pub fn to_base16(&self) -> String {
        HEXLOWER.encode(&self.digest)
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.digest)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.digest)
    }

    /// `{algo}:{base32}`, the form used in narinfo files and fingerprints.
    pub fn to_prefixed_base32(&self) -> String {
        format!("{}:{}", self.algo, self.to_base32())
    }

    pub fn to_sri(&self) -> String {
        format!("{}-{}", self.algo, self.to_base64())
    }

    /// Parse a digest string carrying its own `algo:` or SRI `algo-`
    /// prefix.
    pub fn parse_any_prefixed(s: &str) -> Result<Self, Error> {
        Self::parse(s, None)
    }

    /// Parse a digest string, with or without prefix; a bare digest is
    /// only accepted when `expected` supplies the algorithm, and a
    /// prefixed digest must agree with `expected` when both are given.
    pub fn parse(s: &str, expected: Option<Algo>) -> Result<Self, Error> {
        let (algo, rest) = if let Some((prefix, rest)) = s.split_once(':') {
            (prefix.parse::<Algo>()?, rest)
        } else if let Some((prefix, rest)) = s.split_once('-') {
            (prefix.parse::<Algo>()?, rest)
        } else {
            let algo = expected.ok_or_else(|| Error::MissingAlgo(s.to_string()))?;
            (algo, s)
        };

        if let Some(expected) = expected {
            if algo != expected {
                return Err(Error::AlgoMismatch(s.to_string(), algo, expected));
            }
        }

        let n = algo.digest_len();
        let digest = if rest.len() == HEXLOWER.encode_len(n) {
            HEXLOWER
                .decode(rest.as_bytes())
                .map_err(|_| Error::InvalidBase16(rest.to_string()))?
        } else if rest.len() == base32::encode_len(n) {
            base32::decode(rest.as_bytes()).map_err(Error::InvalidBase32)?
        } else if rest.len() == BASE64.encode_len(n) {
            BASE64
                .decode(rest.as_bytes())
                .map_err(|_| Error::InvalidBase64(rest.to_string()))?
        } else {
            return Err(Error::WrongLength(rest.len(), algo));
        };

        Hash::new(algo, digest)
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_prefixed_base32())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_prefixed_base32())
    }
}

enum Hasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Hasher {
    fn new(algo: Algo) -> Self {
        match algo {
            Algo::Md5 => Hasher::Md5(md5::Md5::new()),
            Algo::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            Algo::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Algo::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finish(self, algo: Algo) -> Hash {
        let digest = match self {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        };
        Hash { algo, digest }
    }
}

/// A [Write] adapter that hashes and counts everything flowing through
/// it before handing it to the inner writer.
pub struct HashSink<W: Write> {
    inner: W,
    algo: Algo,
    hasher: Hasher,
    len: u64,
}

impl HashSink<io::Sink> {
    /// A sink that only hashes, discarding the bytes.
    pub fn sink(algo: Algo) -> Self {
        HashSink::new(algo, io::sink())
    }
}

impl<W: Write> HashSink<W> {
    pub fn new(algo: Algo, inner: W) -> Self {
        HashSink {
            inner,
            algo,
            hasher: Hasher::new(algo),
            len: 0,
        }
    }

    /// Returns the digest and the number of bytes written.
    pub fn finish(self) -> (Hash, u64) {
        (self.hasher.finish(self.algo), self.len)
    }

    /// Like [finish](Self::finish), but also hands back the inner
    /// writer.
    pub fn into_parts(self) -> (Hash, u64, W) {
        (self.hasher.finish(self.algo), self.len, self.inner)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write> Write for HashSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash a byte string in one go.
pub fn hash_bytes(algo: Algo, data: impl AsRef<[u8]>) -> Hash {
    let mut hasher = Hasher::new(algo);
    hasher.update(data.as_ref());
    hasher.finish(algo)
}
