//! The path-info record: metadata of one valid store path.
//!
//! The record is immutable once registered, except for signature
//! insertion. Signatures cover the *fingerprint*, a canonical string
//! over (path, nar-hash, nar-size, references) - nothing else, so
//! cache-specific fields can differ between copies of the same path.

use std::collections::BTreeSet;

use crate::ca::ContentAddress;
use crate::hash::Hash;
use crate::narinfo::{Signature, SigningKey, VerifyingKey};
use crate::store_path::{StoreDir, StorePath};

/// Render the canonical fingerprint that signatures are computed over:
/// `1;{path};sha256:{nar-hash b32};{nar-size};{refs}` with absolute,
/// comma-joined, sorted references.
pub fn fingerprint<'a>(
    store_dir: &StoreDir,
    path: &StorePath,
    nar_hash: &[u8; 32],
    nar_size: u64,
    references: impl IntoIterator<Item = &'a StorePath>,
) -> String {
    format!(
        "1;{};sha256:{};{};{}",
        store_dir.display_path(path),
        crate::base32::encode(nar_hash),
        nar_size,
        references
            .into_iter()
            .map(|r| store_dir.display_path(r))
            .collect::<Vec<_>>()
            .join(",")
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathInfo {
    pub path: StorePath,
    /// Store paths referenced by the artifact's bytes. May contain
    /// `path` itself; the fingerprint treats self-references like any
    /// other.
    pub references: BTreeSet<StorePath>,
    /// SHA-256 of the NAR serialization of the tree at `path`.
    pub nar_hash: [u8; 32],
    /// Length of that serialization in bytes.
    pub nar_size: u64,
    /// The derivation that produced this path, if known.
    pub deriver: Option<StorePath>,
    /// Content address; when set, `path` is derivable from it and does
    /// not need a signature to be trusted.
    pub ca: Option<ContentAddress>,
    pub signatures: Vec<Signature>,
    /// Seconds since epoch at first registration.
    pub registration_time: i64,
    /// True iff this path was produced by a local build, making it
    /// authoritative without any signature.
    pub ultimate: bool,
}

impl PathInfo {
    pub fn new(path: StorePath, nar_hash: [u8; 32], nar_size: u64) -> Self {
        PathInfo {
            path,
            references: BTreeSet::new(),
            nar_hash,
            nar_size,
            deriver: None,
            ca: None,
            signatures: Vec::new(),
            registration_time: 0,
            ultimate: false,
        }
    }

    pub fn nar_hash(&self) -> Hash {
        Hash::sha256(self.nar_hash)
    }

    pub fn fingerprint(&self, store_dir: &StoreDir) -> String {
        fingerprint(
            store_dir,
            &self.path,
            &self.nar_hash,
            self.nar_size,
            self.references.iter(),
        )
    }

    /// Add a signature by `key`, replacing an earlier signature with
    /// the same key name. Signature insertion is the only permitted
    /// mutation of a registered record.
    pub fn sign(&mut self, store_dir: &StoreDir, key: &SigningKey) {
        let sig = key.sign(self.fingerprint(store_dir).as_bytes());
        self.signatures.retain(|s| s.name() != sig.name());
        self.signatures.push(sig);
    }

    /// True iff at least one signature validates under a key in
    /// `trusted`.
    pub fn check_signatures(&self, store_dir: &StoreDir, trusted: &[VerifyingKey]) -> bool {
        let fingerprint = self.fingerprint(store_dir);
        self.signatures
            .iter()
            .any(|sig| trusted.iter().any(|key| key.verify(&fingerprint, sig)))
    }

    /// Whether this record can be accepted without a trusted
    /// signature: locally built or content-addressed.
    pub fn is_trustworthy_without_signature(&self) -> bool {
        self.ultimate || self.ca.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::narinfo::test_keys;
    use crate::narinfo::{Signature, SigningKey, VerifyingKey};
    use crate::store_path::{StoreDir, StorePath};

    use super::PathInfo;

    fn sample() -> (StoreDir, PathInfo) {
        let store_dir = StoreDir::default();
        let path: StorePath = "syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin"
            .parse()
            .unwrap();
        let references: BTreeSet<StorePath> = [
            "0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0",
            "6w8g7njm4mck5dmjxws0z1xnrxvl81xa-glibc-2.34-115",
            "j5jxw3iy7bbz4a57fh9g2xm2gxmyal8h-zlib-1.2.12",
            "yxvjs9drzsphm9pcf42a4byzj1kb9m7k-openssl-1.1.1n",
        ]
        .into_iter()
        .map(|s| s.parse().unwrap())
        .collect();

        let nar_hash = crate::base32::decode_fixed::<32>(
            "1b4sb93wp679q4zx9k1ignby1yna3z7c4c2ri3wphylbc2dwsys0",
        )
        .unwrap();

        let mut info = PathInfo::new(path, nar_hash, 196040);
        info.references = references;
        (store_dir, info)
    }

    #[test]
    fn fingerprint_matches_upstream_format() {
        let (store_dir, info) = sample();
        assert_eq!(
            info.fingerprint(&store_dir),
            "1;/nix/store/syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin;sha256:1b4sb93wp679q4zx9k1ignby1yna3z7c4c2ri3wphylbc2dwsys0;196040;/nix/store/0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0,/nix/store/6w8g7njm4mck5dmjxws0z1xnrxvl81xa-glibc-2.34-115,/nix/store/j5jxw3iy7bbz4a57fh9g2xm2gxmyal8h-zlib-1.2.12,/nix/store/yxvjs9drzsphm9pcf42a4byzj1kb9m7k-openssl-1.1.1n"
        );
    }

    #[test]
    fn real_world_signature_verifies() {
        let (store_dir, info) = sample();
        let key =
            VerifyingKey::parse("cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=")
                .unwrap();
        let sig = Signature::parse("cache.nixos.org-1:TsTTb3WGTZKphvYdBHXwo6weVILmTytUjLB+vcX89fOjjRicCHmKA4RCPMVLkj6TMJ4GMX3HPVWRdD1hkeKZBQ==").unwrap();
        assert!(key.verify(&info.fingerprint(&store_dir), &sig));
    }

    #[test]
    fn sign_then_check() {
        let (store_dir, mut info) = sample();
        let sk = SigningKey::parse(test_keys::SECRET).unwrap();
        let vk = VerifyingKey::parse(test_keys::PUBLIC).unwrap();

        assert!(!info.check_signatures(&store_dir, &[vk.clone()]));
        info.sign(&store_dir, &sk);
        assert!(info.check_signatures(&store_dir, &[vk.clone()]));

        // re-signing with the same key doesn't accumulate signatures
        info.sign(&store_dir, &sk);
        assert_eq!(info.signatures.len(), 1);
    }

    #[test]
    fn tampering_invalidates() {
        let (store_dir, mut info) = sample();
        let sk = SigningKey::parse(test_keys::SECRET).unwrap();
        let vk = SigningKey::parse(test_keys::SECRET).unwrap().to_verifying_key();
        info.sign(&store_dir, &sk);

        for tamper in [
            |i: &mut PathInfo| i.nar_size += 1,
            |i: &mut PathInfo| i.nar_hash[0] ^= 1,
            |i: &mut PathInfo| {
                i.references
                    .insert("00bgd045z0d4icpbc2yyz4gx48ak44la-extra".parse().unwrap());
            },
        ] {
            let mut copy = info.clone();
            tamper(&mut copy);
            assert!(!copy.check_signatures(&store_dir, &[vk.clone()]));
        }

        // fields outside the fingerprint don't affect verification
        let mut copy = info.clone();
        copy.ultimate = true;
        copy.registration_time = 123;
        assert!(copy.check_signatures(&store_dir, &[vk]));
    }
}
