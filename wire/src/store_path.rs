//! Store paths: the identifiers of artifacts.
//!
//! A store path renders as `{store-dir}/{digest}-{name}` where the
//! digest part is 20 bytes in [crate::base32] (32 characters). The
//! digest is derived from a type-tagged fingerprint, never from the
//! artifact bytes directly; see [StoreDir::make_store_path].

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::base32;
use crate::ca::ContentAddress;
use crate::hash::{Algo, Hash};

pub const DIGEST_LEN: usize = 20;
pub const ENCODED_DIGEST_LEN: usize = 32;

#[derive(Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("path is too short to contain a digest and a name")]
    TooShort,
    #[error("missing dash between digest and name")]
    MissingDash,
    #[error("invalid digest encoding: {0}")]
    InvalidDigest(base32::DecodeError),
    #[error("invalid name {0:?}: character at position {1} not allowed")]
    InvalidName(String, usize),
    #[error("path {0:?} does not lie in store directory {1:?}")]
    NotInStore(String, String),
}

/// A store path without its store-dir prefix: a 20-byte digest plus a
/// human-readable name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    digest: [u8; DIGEST_LEN],
    name: String,
}

impl StorePath {
    pub fn new(digest: [u8; DIGEST_LEN], name: &str) -> Result<Self, Error> {
        validate_name(name)?;
        Ok(StorePath {
            digest,
            name: name.to_string(),
        })
    }

    /// Parse the `{digest}-{name}` basename of a store path.
    pub fn from_basename(s: &str) -> Result<Self, Error> {
        if s.len() < ENCODED_DIGEST_LEN + 2 {
            return Err(Error::TooShort);
        }
        let digest = base32::decode_fixed::<DIGEST_LEN>(&s.as_bytes()[..ENCODED_DIGEST_LEN])
            .map_err(Error::InvalidDigest)?;
        if s.as_bytes()[ENCODED_DIGEST_LEN] != b'-' {
            return Err(Error::MissingDash);
        }
        StorePath::new(digest, &s[ENCODED_DIGEST_LEN + 1..])
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// The digest part in its textual form, as used for narinfo keys
    /// and the valid-paths database.
    pub fn digest_str(&self) -> String {
        base32::encode(&self.digest)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for StorePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorePath::from_basename(s)
    }
}

impl Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", base32::encode(&self.digest), self.name)
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePath({self})")
    }
}

// Ordering follows the rendered basename, which all external sorted
// forms (narinfo references, fingerprints) are defined on. Since the
// encoded digest has fixed width, comparing (encoded digest, name) is
// equivalent to comparing the rendered strings.
impl Ord for StorePath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        base32::encode(&self.digest)
            .cmp(&base32::encode(&other.digest))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for StorePath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl serde::Serialize for StorePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for StorePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StorePath::from_basename(&s).map_err(serde::de::Error::custom)
    }
}

fn validate_name(s: &str) -> Result<(), Error> {
    if s.is_empty() {
        return Err(Error::TooShort);
    }
    for (i, c) in s.bytes().enumerate() {
        if c.is_ascii_alphanumeric()
            || (c == b'.' && i != 0)
            || c == b'-'
            || c == b'_'
            || c == b'+'
            || c == b'?'
            || c == b'='
        {
            continue;
        }
        return Err(Error::InvalidName(s.to_string(), i));
    }
    Ok(())
}

/// The configured store prefix. All rendering of and parsing from
/// absolute paths goes through this; [StorePath] itself never carries
/// the prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreDir(String);

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir("/nix/store".to_string())
    }
}

impl Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StoreDir {
    pub fn new(dir: impl Into<String>) -> Self {
        let mut dir = dir.into();
        while dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }
        StoreDir(dir)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render the absolute path of `path` under this store dir.
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    pub fn real_path(&self, path: &StorePath) -> PathBuf {
        Path::new(&self.0).join(path.to_string())
    }

    /// Parse an absolute path that must be a direct child of this
    /// store dir.
    pub fn parse_path(&self, s: &str) -> Result<StorePath, Error> {
        let rest = s
            .strip_prefix(&self.0)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| Error::NotInStore(s.to_string(), self.0.clone()))?;
        StorePath::from_basename(rest)
    }

    /// The type-tagged fingerprint hash that defines every store path:
    /// `sha256("{type}:sha256:{hex-digest}:{store-dir}:{name}")`,
    /// XOR-folded down to 20 bytes.
    pub fn make_store_path(&self, path_type: &str, hash: &Hash, name: &str) -> Result<StorePath, Error> {
        let fingerprint = format!(
            "{}:{}:{}:{}:{}",
            path_type,
            hash.algo(),
            hash.to_base16(),
            self.0,
            name
        );
        let digest = Sha256::new_with_prefix(fingerprint.as_bytes()).finalize();
        StorePath::new(compress_hash(&digest), name)
    }

    /// Path of a literal text file (derivations, closure expressions)
    /// with known references.
    pub fn make_text_path<'a>(
        &self,
        name: &str,
        content_hash: &Hash,
        references: impl IntoIterator<Item = &'a StorePath>,
    ) -> Result<StorePath, Error> {
        self.make_store_path(&self.make_type("text", references, false), content_hash, name)
    }

    /// Path of a content-addressed artifact, derived from its
    /// content-address descriptor, name and references.
    pub fn make_ca_path<'a>(
        &self,
        name: &str,
        ca: &ContentAddress,
        references: impl IntoIterator<Item = &'a StorePath>,
        has_self_reference: bool,
    ) -> Result<StorePath, Error> {
        use crate::ca::Method;
        match (ca.method, ca.hash.algo()) {
            (Method::Recursive, Algo::Sha256) => self.make_store_path(
                &self.make_type("source", references, has_self_reference),
                &ca.hash,
                name,
            ),
            _ => {
                let inner = format!(
                    "fixed:out:{}{}:{}:",
                    ca.method.prefix(),
                    ca.hash.algo(),
                    ca.hash.to_base16()
                );
                let outer = Hash::sha256(
                    Sha256::new_with_prefix(inner.as_bytes()).finalize().into(),
                );
                self.make_store_path("output:out", &outer, name)
            }
        }
    }

    /// Path of a derivation output, keyed by the derivation's own
    /// hash.
    pub fn make_output_path(
        &self,
        output_name: &str,
        drv_hash: &Hash,
        name: &str,
    ) -> Result<StorePath, Error> {
        self.make_store_path(&format!("output:{output_name}"), drv_hash, name)
    }

    // References inside the type tag are rendered as absolute paths.
    fn make_type<'a>(
        &self,
        prefix: &str,
        references: impl IntoIterator<Item = &'a StorePath>,
        has_self_reference: bool,
    ) -> String {
        let mut t = prefix.to_string();
        for r in references {
            t.push(':');
            t.push_str(&self.display_path(r));
        }
        if has_self_reference {
            t.push_str(":self");
        }
        t
    }
}

/// XOR-fold an arbitrary digest down to the store-path digest size.
pub fn compress_hash(input: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    for (i, b) in input.iter().enumerate() {
        out[i % DIGEST_LEN] ^= b;
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::hash::{hash_bytes, Algo};

    use super::{StoreDir, StorePath};

    #[test]
    fn parse_basename() {
        let p = StorePath::from_basename("00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432")
            .unwrap();
        assert_eq!(p.name(), "net-tools-1.60_p20170221182432");
        assert_eq!(
            p.digest(),
            &[
                0x8a, 0x12, 0x32, 0x15, 0x22, 0xfd, 0x91, 0xef, 0xbd, 0x60, 0xeb,
                0xb2, 0x48, 0x1a, 0xf8, 0x85, 0x80, 0xf6, 0x16, 0x00
            ]
        );
        assert_eq!(
            p.to_string(),
            "00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432"
        );
    }

    #[test]
    fn parse_rejects() {
        // rejected when adding an empty .gitignore: names can't start with a dot
        StorePath::from_basename("fli4bwscgna7lpm7v5xgnjxrxh0yc7ra-.gitignore").unwrap_err();
        StorePath::from_basename("00bgd045z0d4icpbc2yy-net-tools-1.60").unwrap_err();
        StorePath::from_basename("00bgd045z0d4icpbc2yyz4gx48aku4la-net-tools-1.60").unwrap_err();
        StorePath::from_basename("00bgd045z0d4icpbc2yyz4gx48ak44la+name").unwrap_err();
    }

    #[test]
    fn absolute_paths() {
        let store_dir = StoreDir::default();
        let p = StorePath::from_basename("00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432")
            .unwrap();
        let abs = store_dir.display_path(&p);
        assert_eq!(
            abs,
            "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432"
        );
        assert_eq!(store_dir.parse_path(&abs).unwrap(), p);

        store_dir.parse_path("/tmp/foo").unwrap_err();
        store_dir.parse_path("/nix/store").unwrap_err();
    }

    #[test]
    fn text_path_matches_upstream() {
        // `builtins.toFile "foo" "bar"` yields
        // /nix/store/vxjiwkjkn7x4079qvh1jkl5pn05j2aw0-foo
        let store_dir = StoreDir::default();
        let h = hash_bytes(Algo::Sha256, b"bar");
        let p = store_dir.make_text_path("foo", &h, []).unwrap();
        assert_eq!(
            store_dir.display_path(&p),
            "/nix/store/vxjiwkjkn7x4079qvh1jkl5pn05j2aw0-foo"
        );
    }

    #[test]
    fn text_path_with_references() {
        // `builtins.toFile "baz" "${builtins.toFile "foo" "bar"}"` yields
        // /nix/store/5xd714cbfnkz02h2vbsj4fm03x3f15nf-baz
        let store_dir = StoreDir::default();
        let inner = store_dir
            .make_text_path("foo", &hash_bytes(Algo::Sha256, b"bar"), [])
            .unwrap();
        let inner_abs = store_dir.display_path(&inner);
        let outer = store_dir
            .make_text_path("baz", &hash_bytes(Algo::Sha256, inner_abs.as_bytes()), [&inner])
            .unwrap();
        assert_eq!(
            store_dir.display_path(&outer),
            "/nix/store/5xd714cbfnkz02h2vbsj4fm03x3f15nf-baz"
        );
    }

    #[test]
    fn ordering_is_lexicographic_on_basename() {
        let a: StorePath = "00bgd045z0d4icpbc2yyz4gx48ak44la-aaa".parse().unwrap();
        let b: StorePath = "00bgd045z0d4icpbc2yyz4gx48ak44la-bbb".parse().unwrap();
        assert!(a < b);
    }
}
