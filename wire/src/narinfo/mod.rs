//! The textual path-info record served by binary caches.
//!
//! One `Key: value` pair per line. Writing is strict and deterministic
//! (fixed field order, LF endings) so that re-serializing a parsed
//! file is byte-stable; parsing is forgiving of unknown keys, which
//! are preserved for round-tripping.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

mod keys;
mod signature;

pub use keys::{KeyError, SigningKey, VerifyingKey};
pub use signature::{Signature, SignatureError};

use crate::base32;
use crate::ca::ContentAddress;
use crate::hash::{Algo, Hash};
use crate::path_info::PathInfo;
use crate::store_path::{StoreDir, StorePath};

/// Compression applied to the NAR object a narinfo points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Bzip2,
    Gzip,
    Zstd,
    Brotli,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Xz => "xz",
            Compression::Bzip2 => "bzip2",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Brotli => "br",
        }
    }

    /// File name suffix of the compressed object, including the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Xz => ".xz",
            Compression::Bzip2 => ".bz2",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
            Compression::Brotli => ".br",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => Compression::None,
            "xz" => Compression::Xz,
            "bzip2" => Compression::Bzip2,
            "gzip" => Compression::Gzip,
            "zstd" => Compression::Zstd,
            "br" => Compression::Brotli,
            _ => return Err(Error::UnknownCompression(s.to_string())),
        })
    }
}

#[derive(Clone, Debug)]
pub struct NarInfo {
    pub path: StorePath,
    /// Object-backend key of the compressed NAR, relative to the cache
    /// root.
    pub url: String,
    pub compression: Compression,
    /// Digest of the compressed object at `url`.
    pub file_hash: Option<Hash>,
    /// Size of the compressed object.
    pub file_size: Option<u64>,
    pub nar_hash: [u8; 32],
    pub nar_size: u64,
    /// Sorted when written; parse records them in file order.
    pub references: Vec<StorePath>,
    pub deriver: Option<StorePath>,
    pub system: Option<String>,
    pub signatures: Vec<Signature>,
    pub ca: Option<ContentAddress>,
    /// Unknown keys, preserved in input order for round-tripping.
    pub extra: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid line {0:?}")]
    InvalidLine(String),
    #[error("duplicate field {0}")]
    DuplicateField(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid StorePath: {0}")]
    InvalidStorePath(#[from] crate::store_path::Error),
    #[error("invalid {0}: {1}")]
    InvalidHash(&'static str, crate::hash::Error),
    #[error("invalid size in {0}: {1:?}")]
    InvalidSize(&'static str, String),
    #[error("invalid reference #{0}: {1}")]
    InvalidReference(usize, crate::store_path::Error),
    #[error("unknown compression {0:?}")]
    UnknownCompression(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("invalid CA field: {0}")]
    InvalidCa(#[from] crate::ca::Error),
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &str) -> Result<(), Error> {
    if slot.replace(value).is_some() {
        return Err(Error::DuplicateField(field.to_string()));
    }
    Ok(())
}

impl NarInfo {
    pub fn parse(store_dir: &StoreDir, input: &str) -> Result<Self, Error> {
        let mut path = None;
        let mut url = None;
        let mut compression = None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = None;
        let mut deriver = None;
        let mut system = None;
        let mut signatures = vec![];
        let mut ca = None;
        let mut extra = vec![];

        for line in input.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .and_then(|(k, v)| Some((k, v.strip_prefix(' ')?)))
                .ok_or_else(|| Error::InvalidLine(line.to_string()))?;

            match key {
                "StorePath" => {
                    set_once(&mut path, store_dir.parse_path(value)?, key)?;
                }
                "URL" => {
                    set_once(&mut url, value.to_string(), key)?;
                }
                "Compression" => {
                    set_once(&mut compression, value.parse::<Compression>()?, key)?;
                }
                "FileHash" => {
                    let h = Hash::parse_any_prefixed(value)
                        .map_err(|e| Error::InvalidHash("FileHash", e))?;
                    set_once(&mut file_hash, h, key)?;
                }
                "FileSize" => {
                    let n = value
                        .parse::<u64>()
                        .map_err(|_| Error::InvalidSize("FileSize", value.to_string()))?;
                    set_once(&mut file_size, n, key)?;
                }
                "NarHash" => {
                    let h = Hash::parse(value, Some(Algo::Sha256))
                        .map_err(|e| Error::InvalidHash("NarHash", e))?;
                    set_once(
                        &mut nar_hash,
                        h.digest_fixed::<32>().expect("sha256 is 32 bytes"),
                        key,
                    )?;
                }
                "NarSize" => {
                    let n = value
                        .parse::<u64>()
                        .map_err(|_| Error::InvalidSize("NarSize", value.to_string()))?;
                    set_once(&mut nar_size, n, key)?;
                }
                "References" => {
                    let refs = if value.is_empty() {
                        vec![]
                    } else {
                        value
                            .split(' ')
                            .enumerate()
                            .map(|(i, s)| {
                                StorePath::from_basename(s)
                                    .map_err(|e| Error::InvalidReference(i, e))
                            })
                            .collect::<Result<Vec<_>, _>>()?
                    };
                    set_once(&mut references, refs, key)?;
                }
                "Deriver" => {
                    if !value.is_empty() {
                        set_once(&mut deriver, StorePath::from_basename(value)?, key)?;
                    }
                }
                "System" => {
                    set_once(&mut system, value.to_string(), key)?;
                }
                "Sig" => {
                    signatures.push(Signature::parse(value)?);
                }
                "CA" => {
                    set_once(&mut ca, value.parse::<ContentAddress>()?, key)?;
                }
                _ => {
                    extra.push((key.to_string(), value.to_string()));
                }
            }
        }

        Ok(NarInfo {
            path: path.ok_or(Error::MissingField("StorePath"))?,
            url: url.ok_or(Error::MissingField("URL"))?,
            // historically, a missing Compression field means bzip2
            compression: compression.unwrap_or(Compression::Bzip2),
            file_hash,
            file_size,
            nar_hash: nar_hash.ok_or(Error::MissingField("NarHash"))?,
            nar_size: nar_size.ok_or(Error::MissingField("NarSize"))?,
            references: references.ok_or(Error::MissingField("References"))?,
            deriver,
            system,
            signatures,
            ca,
            extra,
        })
    }

    /// Render in the canonical field order. The inverse of [parse] on
    /// anything [parse] accepts, up to reference ordering.
    pub fn to_text(&self, store_dir: &StoreDir) -> String {
        struct Text<'a>(&'a NarInfo, &'a StoreDir);

        impl fmt::Display for Text<'_> {
            fn fmt(&self, w: &mut fmt::Formatter<'_>) -> fmt::Result {
                let Text(info, store_dir) = self;

                writeln!(w, "StorePath: {}", store_dir.display_path(&info.path))?;
                writeln!(w, "URL: {}", info.url)?;
                writeln!(w, "Compression: {}", info.compression)?;
                if let Some(file_hash) = &info.file_hash {
                    writeln!(w, "FileHash: {}", file_hash.to_prefixed_base32())?;
                }
                if let Some(file_size) = info.file_size {
                    writeln!(w, "FileSize: {file_size}")?;
                }
                writeln!(w, "NarHash: sha256:{}", base32::encode(&info.nar_hash))?;
                writeln!(w, "NarSize: {}", info.nar_size)?;

                let mut references = info.references.clone();
                references.sort();
                write!(w, "References:")?;
                if references.is_empty() {
                    write!(w, " ")?;
                }
                for r in &references {
                    write!(w, " {r}")?;
                }
                writeln!(w)?;

                if let Some(deriver) = &info.deriver {
                    writeln!(w, "Deriver: {deriver}")?;
                }
                if let Some(system) = &info.system {
                    writeln!(w, "System: {system}")?;
                }
                for sig in &info.signatures {
                    writeln!(w, "Sig: {sig}")?;
                }
                if let Some(ca) = &info.ca {
                    writeln!(w, "CA: {ca}")?;
                }
                for (key, value) in &info.extra {
                    writeln!(w, "{key}: {value}")?;
                }

                Ok(())
            }
        }

        Text(self, store_dir).to_string()
    }

    /// The cache object key of the narinfo file for a store path.
    pub fn key_for(path: &StorePath) -> String {
        format!("{}.narinfo", path.digest_str())
    }

    pub fn fingerprint(&self, store_dir: &StoreDir) -> String {
        let mut references = self.references.clone();
        references.sort();
        crate::path_info::fingerprint(
            store_dir,
            &self.path,
            &self.nar_hash,
            self.nar_size,
            references.iter(),
        )
    }

    pub fn add_signature(&mut self, store_dir: &StoreDir, key: &SigningKey) {
        let sig = key.sign(self.fingerprint(store_dir).as_bytes());
        self.signatures.retain(|s| s.name() != sig.name());
        self.signatures.push(sig);
    }

    pub fn check_signatures(&self, store_dir: &StoreDir, trusted: &[VerifyingKey]) -> bool {
        let fingerprint = self.fingerprint(store_dir);
        self.signatures
            .iter()
            .any(|sig| trusted.iter().any(|key| key.verify(&fingerprint, sig)))
    }

    /// Build the cache-borne record from a local path-info plus the
    /// upload parameters.
    pub fn from_path_info(
        info: &PathInfo,
        url: String,
        compression: Compression,
        file_hash: Option<Hash>,
        file_size: Option<u64>,
    ) -> Self {
        NarInfo {
            path: info.path.clone(),
            url,
            compression,
            file_hash,
            file_size,
            nar_hash: info.nar_hash,
            nar_size: info.nar_size,
            references: info.references.iter().cloned().collect(),
            deriver: info.deriver.clone(),
            system: None,
            signatures: info.signatures.clone(),
            ca: info.ca.clone(),
            extra: vec![],
        }
    }

    pub fn to_path_info(&self, registration_time: i64) -> PathInfo {
        PathInfo {
            path: self.path.clone(),
            references: self.references.iter().cloned().collect(),
            nar_hash: self.nar_hash,
            nar_size: self.nar_size,
            deriver: self.deriver.clone(),
            ca: self.ca.clone(),
            signatures: self.signatures.clone(),
            registration_time,
            ultimate: false,
        }
    }
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::store_path::StoreDir;

    use super::{Compression, NarInfo};

    const CURL: &str = r#"StorePath: /nix/store/syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin
URL: nar/05ra3y72i3qjri7xskf9qj8kb29r6naqy1sqpbs3azi3xcigmj56.nar.xz
Compression: xz
FileHash: sha256:05ra3y72i3qjri7xskf9qj8kb29r6naqy1sqpbs3azi3xcigmj56
FileSize: 68852
NarHash: sha256:1b4sb93wp679q4zx9k1ignby1yna3z7c4c2ri3wphylbc2dwsys0
NarSize: 196040
References: 0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0 6w8g7njm4mck5dmjxws0z1xnrxvl81xa-glibc-2.34-115 j5jxw3iy7bbz4a57fh9g2xm2gxmyal8h-zlib-1.2.12 yxvjs9drzsphm9pcf42a4byzj1kb9m7k-openssl-1.1.1n
Deriver: 5rwxzi7pal3qhpsyfc16gzkh939q1np6-curl-7.82.0.drv
Sig: cache.nixos.org-1:TsTTb3WGTZKphvYdBHXwo6weVILmTytUjLB+vcX89fOjjRicCHmKA4RCPMVLkj6TMJ4GMX3HPVWRdD1hkeKZBQ==
"#;

    #[test]
    fn roundtrip() {
        let store_dir = StoreDir::default();
        let parsed = NarInfo::parse(&store_dir, CURL).unwrap();

        assert_eq!(parsed.compression, Compression::Xz);
        assert_eq!(parsed.nar_size, 196040);
        assert_eq!(parsed.references.len(), 4);
        assert_eq!(parsed.signatures.len(), 1);
        assert_eq!(
            parsed.deriver.as_ref().unwrap().name(),
            "curl-7.82.0.drv"
        );

        assert_eq!(parsed.to_text(&store_dir), CURL);
    }

    #[test]
    fn signature_against_trust_set() {
        let store_dir = StoreDir::default();
        let parsed = NarInfo::parse(&store_dir, CURL).unwrap();
        let trusted = vec![super::VerifyingKey::parse(
            "cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=",
        )
        .unwrap()];
        assert!(parsed.check_signatures(&store_dir, &trusted));

        let other = vec![super::VerifyingKey::parse(super::test_keys::PUBLIC).unwrap()];
        assert!(!parsed.check_signatures(&store_dir, &other));
    }

    #[test]
    fn unknown_keys_preserved() {
        let store_dir = StoreDir::default();
        let input = CURL.to_string() + "FutureField: some value\n";
        let parsed = NarInfo::parse(&store_dir, &input).unwrap();
        assert_eq!(
            parsed.extra,
            vec![("FutureField".to_string(), "some value".to_string())]
        );
        assert_eq!(parsed.to_text(&store_dir), input);
    }

    #[test]
    fn missing_compression_defaults_to_bzip2() {
        let store_dir = StoreDir::default();
        let input: String = CURL.lines().filter(|l| !l.starts_with("Compression:"))
            .map(|l| format!("{l}\n"))
            .collect();
        let parsed = NarInfo::parse(&store_dir, &input).unwrap();
        assert_eq!(parsed.compression, Compression::Bzip2);
    }

    #[test]
    fn empty_references_line() {
        let store_dir = StoreDir::default();
        let input = "StorePath: /nix/store/k20pahypzvr49fy82cw5sx72hdfg3qcr-texlive-hyphenex-37354\n\
URL: nar/0i5biw0g01514llhfswxy6xfav8lxxdq1xg6ik7hgsqbpw0f06yi.nar.xz\n\
Compression: xz\n\
NarHash: sha256:0h1bm4sj1cnfkxgyhvgi8df1qavnnv94sd0v09wcrm971602shfg\n\
NarSize: 22552\n\
References: \n\
CA: fixed:r:sha1:1ak1ymbmsfx7z8kh09jzkr3a4dvkrfjw\n";
        let parsed = NarInfo::parse(&store_dir, input).unwrap();
        assert!(parsed.references.is_empty());
        assert!(parsed.ca.is_some());
    }

    #[test]
    fn hex_nar_hash_accepted() {
        let store_dir = StoreDir::default();
        let input = CURL.replace(
            "NarHash: sha256:1b4sb93wp679q4zx9k1ignby1yna3z7c4c2ri3wphylbc2dwsys0",
            "NarHash: sha256:574c5efc212881d6d0b73a88fba4adab11dbea72ca184fb32fe1fce0efe1eb33",
        );
        // different digest value, but the encoding parses
        NarInfo::parse(&store_dir, &input).unwrap();
    }

    #[test]
    fn rejects_malformed() {
        let store_dir = StoreDir::default();
        NarInfo::parse(&store_dir, "NoColonHere\n").unwrap_err();
        NarInfo::parse(&store_dir, "URL: nar/x.nar.xz\n").unwrap_err();
        let dup = CURL.to_string() + "NarSize: 196040\n";
        NarInfo::parse(&store_dir, &dup).unwrap_err();
    }
}
