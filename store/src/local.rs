//! The local store: artifacts on disk plus the valid-paths database.
//!
//! All ingestion goes through the same shape: serialize (or receive)
//! the NAR, hash and scan it, materialize the tree next to its final
//! location, canonicalize permissions, and only then register validity
//! in one transaction. A crash before registration leaves garbage that
//! the next GC sweeps; it never leaves a valid-but-incomplete path.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, instrument};

use nixwire::ca::{ContentAddress, Method};
use nixwire::hash::{hash_bytes, Algo, HashSink};
use nixwire::nar;
use nixwire::narinfo::{SigningKey, VerifyingKey};
use nixwire::path_info::PathInfo;
use nixwire::store_path::{StorePath, ENCODED_DIGEST_LEN};

use crate::build::lock::PathLocks;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::refscan::RefScanSink;
use crate::settings::Settings;

pub struct LocalStore {
    pub settings: Settings,
    pub db: Db,
    signing_keys: Vec<SigningKey>,
    trusted_keys: Vec<VerifyingKey>,
    temp_roots_file: Mutex<Option<File>>,
}

/// Writes into both halves; used to hash and reference-scan in one
/// streaming pass.
struct TeeWrite<A, B>(A, B);

impl<A: Write, B: Write> Write for TeeWrite<A, B> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write_all(buf)?;
        self.1.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()?;
        self.1.flush()
    }
}

/// [Read] adapter hashing everything that passes through.
pub struct HashingReader<R> {
    inner: R,
    sink: HashSink<std::io::Sink>,
}

impl<R: Read> HashingReader<R> {
    pub fn new(algo: Algo, inner: R) -> Self {
        HashingReader {
            inner,
            sink: HashSink::sink(algo),
        }
    }

    pub fn finish(self) -> (nixwire::hash::Hash, u64) {
        self.sink.finish()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.sink.write_all(&buf[..n])?;
        Ok(n)
    }
}

impl LocalStore {
    pub fn open(settings: Settings) -> Result<Self> {
        std::fs::create_dir_all(Path::new(settings.store_dir.as_str()))?;
        std::fs::create_dir_all(settings.gc_roots_dir())?;
        std::fs::create_dir_all(settings.temp_roots_dir())?;
        std::fs::create_dir_all(&settings.log_dir)?;

        let db = Db::open(&settings.db_path())?;

        let mut signing_keys = vec![];
        for file in &settings.secret_key_files {
            let contents = std::fs::read_to_string(file)?;
            signing_keys.push(SigningKey::parse(contents.trim())?);
        }
        let mut trusted_keys = vec![];
        for key in &settings.trusted_public_keys {
            trusted_keys.push(VerifyingKey::parse(key)?);
        }
        // paths we signed ourselves are trusted too
        trusted_keys.extend(signing_keys.iter().map(|k| k.to_verifying_key()));

        Ok(LocalStore {
            settings,
            db,
            signing_keys,
            trusted_keys,
            temp_roots_file: Mutex::new(None),
        })
    }

    pub fn signing_keys(&self) -> &[SigningKey] {
        &self.signing_keys
    }

    pub fn trusted_keys(&self) -> &[VerifyingKey] {
        &self.trusted_keys
    }

    pub fn real_path(&self, path: &StorePath) -> PathBuf {
        self.settings.store_dir.real_path(path)
    }

    pub fn is_valid(&self, path: &StorePath) -> Result<bool> {
        self.db.is_valid(path)
    }

    pub fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>> {
        self.db.query_path_info(path)
    }

    /// The candidate set for reference scanning: every valid path,
    /// keyed by its digest part.
    fn reference_candidates(&self) -> Result<BTreeMap<[u8; ENCODED_DIGEST_LEN], StorePath>> {
        let mut candidates = BTreeMap::new();
        for path in self.db.query_valid_paths()? {
            let digest: [u8; ENCODED_DIGEST_LEN] = path
                .digest_str()
                .into_bytes()
                .try_into()
                .expect("digest part has fixed length");
            candidates.insert(digest, path);
        }
        Ok(candidates)
    }

    /// Scan the tree at `real` (serialized as NAR) for references to
    /// `candidates`, also producing the NAR hash and size.
    pub fn scan_for_references(
        &self,
        real: &Path,
        candidates: &BTreeMap<[u8; ENCODED_DIGEST_LEN], StorePath>,
    ) -> Result<(BTreeSet<StorePath>, [u8; 32], u64)> {
        let scanner = RefScanSink::new(candidates.keys().copied());
        let mut sink = HashSink::new(Algo::Sha256, scanner);
        nar::DumpOptions::default()
            .use_case_hack(self.settings.use_case_hack)
            .dump(real, &mut sink)?;
        let (hash, size, scanner) = sink.into_parts();

        let references = scanner
            .into_found()
            .iter()
            .map(|digest| candidates[digest].clone())
            .collect();
        Ok((
            references,
            hash.digest_fixed().expect("sha256 digest"),
            size,
        ))
    }

    /// Ingest a tree from outside the store, content-addressing it by
    /// its NAR hash. Returns the new (or pre-existing) store path.
    #[instrument(skip(self, source))]
    pub fn add_path_to_store(&self, name: &str, source: &Path) -> Result<StorePath> {
        // one streaming pass: spool the NAR, hash it, scan it
        let spool = tempfile::NamedTempFile::new_in(self.settings.store_dir.as_str())?;
        let candidates = self.reference_candidates()?;
        let scanner = RefScanSink::new(candidates.keys().copied());
        let mut sink = HashSink::new(Algo::Sha256, TeeWrite(spool.as_file(), scanner));
        nar::DumpOptions::default()
            .use_case_hack(self.settings.use_case_hack)
            .dump(source, &mut sink)?;
        let (hash, nar_size, TeeWrite(_, scanner)) = sink.into_parts();

        let references: BTreeSet<StorePath> = scanner
            .into_found()
            .iter()
            .map(|digest| candidates[digest].clone())
            .collect();

        let nar_hash: [u8; 32] = hash.digest_fixed().expect("sha256 digest");
        let ca = ContentAddress {
            method: Method::Recursive,
            hash,
        };
        let dest = self.settings.store_dir.make_ca_path(name, &ca, [], false)?;

        self.materialize_and_register(&dest, spool, |info| {
            info.nar_size = nar_size;
            info.nar_hash = nar_hash;
            info.references = references;
            info.ca = Some(ca);
            info.ultimate = true;
            Ok(())
        })?;
        Ok(dest)
    }

    /// Store a literal text file (store expressions) with known
    /// references.
    #[instrument(skip(self, contents, references))]
    pub fn add_text_to_store<'a>(
        &self,
        name: &str,
        contents: &[u8],
        references: impl IntoIterator<Item = &'a StorePath> + Clone,
    ) -> Result<StorePath> {
        let content_hash = hash_bytes(Algo::Sha256, contents);
        let dest = self
            .settings
            .store_dir
            .make_text_path(name, &content_hash, references.clone())?;

        if self.db.is_valid(&dest)? {
            return Ok(dest);
        }

        let mut locks = PathLocks::new();
        let real = self.real_path(&dest);
        locks.lock([real.as_path()], || false)?;
        if self.db.is_valid(&dest)? {
            return Ok(dest);
        }

        if real.exists() {
            delete_path(&real)?;
        }
        let tmp = tmp_sibling(&real);
        if tmp.exists() {
            delete_path(&tmp)?;
        }
        std::fs::write(&tmp, contents)?;
        make_read_only(&tmp)?;
        std::fs::rename(&tmp, &real)?;

        // the NAR hash is over the file's serialization, not its bytes
        let mut sink = HashSink::sink(Algo::Sha256);
        nar::dump(&real, &mut sink)?;
        let (nar_hash, nar_size) = sink.finish();

        let mut info = PathInfo::new(
            dest.clone(),
            nar_hash.digest_fixed().expect("sha256 digest"),
            nar_size,
        );
        info.references = references.into_iter().cloned().collect();
        info.ca = Some(ContentAddress {
            method: Method::Text,
            hash: content_hash,
        });
        info.ultimate = true;
        self.sign_and_register(info)?;
        locks.set_deletion(true);
        Ok(dest)
    }

    /// Accept a NAR stream for a known path-info record, verifying the
    /// hash while restoring. Used by substitution and cache imports.
    #[instrument(skip(self, info, source), fields(path = %info.path))]
    pub fn add_from_nar<R: Read>(&self, info: &PathInfo, source: R) -> Result<()> {
        if !info.is_trustworthy_without_signature()
            && self.settings.require_sigs
            && !info.check_signatures(&self.settings.store_dir, &self.trusted_keys)
        {
            return Err(Error::SignatureMismatch(info.path.clone()));
        }

        let mut locks = PathLocks::new();
        let real = self.real_path(&info.path);
        locks.lock([real.as_path()], || false)?;
        if self.db.is_valid(&info.path)? {
            return Ok(());
        }
        if real.exists() {
            delete_path(&real)?;
        }

        let tmp = tmp_sibling(&real);
        if tmp.exists() {
            delete_path(&tmp)?;
        }

        let mut reader = HashingReader::new(Algo::Sha256, source);
        let restore_result = nar::restore_with(
            nar::ParseOptions::default().use_case_hack(self.settings.use_case_hack),
            &mut reader,
            &tmp,
        );
        let (actual_hash, actual_size) = reader.finish();

        let verify = restore_result.map_err(Error::from).and_then(|()| {
            if actual_hash.digest() != info.nar_hash || actual_size != info.nar_size {
                Err(Error::CorruptArtifact {
                    path: info.path.clone(),
                    expected: info.nar_hash().to_prefixed_base32(),
                    actual: actual_hash.to_prefixed_base32(),
                })
            } else {
                Ok(())
            }
        });
        if let Err(e) = verify {
            let _ = delete_path(&tmp);
            return Err(e);
        }

        make_read_only(&tmp)?;
        std::fs::rename(&tmp, &real)?;

        let mut info = info.clone();
        info.registration_time = 0; // now
        self.db.register_valid_paths(&[info])?;
        locks.set_deletion(true);
        Ok(())
    }

    /// Stream the archive of a valid path into `sink`, verifying
    /// against the recorded hash.
    #[instrument(skip(self, sink), fields(path = %path))]
    pub fn nar_from_path<W: Write>(&self, path: &StorePath, sink: &mut W) -> Result<PathInfo> {
        let info = self
            .db
            .query_path_info(path)?
            .ok_or_else(|| Error::InvalidPath(path.clone()))?;

        let mut hashing = HashSink::new(Algo::Sha256, sink);
        nar::DumpOptions::default()
            .use_case_hack(self.settings.use_case_hack)
            .dump(&self.real_path(path), &mut hashing)?;
        let (hash, size) = hashing.finish();

        if hash.digest() != info.nar_hash || size != info.nar_size {
            return Err(Error::CorruptArtifact {
                path: path.clone(),
                expected: info.nar_hash().to_prefixed_base32(),
                actual: hash.to_prefixed_base32(),
            });
        }
        Ok(info)
    }

    /// Recompute the archive hash of `path` and compare with the
    /// database record.
    pub fn verify_path(&self, path: &StorePath) -> Result<()> {
        self.nar_from_path(path, &mut std::io::sink()).map(|_| ())
    }

    /// Load a store expression from a valid path.
    pub fn read_store_expr(&self, path: &StorePath) -> Result<nixwire::expr::StoreExpr> {
        if !self.db.is_valid(path)? {
            return Err(Error::InvalidPath(path.clone()));
        }
        let bytes = std::fs::read(self.real_path(path))?;
        Ok(nixwire::expr::StoreExpr::from_json(&bytes)?)
    }

    /// Serialize a store expression into the store and register it.
    pub fn write_store_expr(
        &self,
        name: &str,
        expr: &nixwire::expr::StoreExpr,
    ) -> Result<StorePath> {
        self.add_text_to_store(name, expr.to_json().as_bytes(), [])
    }

    /// Sign with every configured secret key, then register.
    pub fn sign_and_register(&self, mut info: PathInfo) -> Result<()> {
        for key in &self.signing_keys {
            info.sign(&self.settings.store_dir, key);
        }
        self.db.register_valid_paths(&[info])?;
        Ok(())
    }

    /// Register a transient GC root for the lifetime of this process.
    pub fn add_temp_root(&self, path: &StorePath) -> Result<()> {
        let mut guard = self.temp_roots_file.lock().expect("temp-roots mutex poisoned");
        if guard.is_none() {
            let file_path = self
                .settings
                .temp_roots_dir()
                .join(std::process::id().to_string());
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)?;
            debug!(path = %file_path.display(), "created temp-roots file");
            *guard = Some(file);
        }
        let file = guard.as_mut().expect("just initialized");
        writeln!(file, "{}", self.settings.store_dir.display_path(path))?;
        file.sync_data()?;
        Ok(())
    }

    fn materialize_and_register(
        &self,
        dest: &StorePath,
        spool: tempfile::NamedTempFile,
        fill: impl FnOnce(&mut PathInfo) -> Result<()>,
    ) -> Result<()> {
        if self.db.is_valid(dest)? {
            debug!(path = %dest, "already valid");
            return Ok(());
        }

        let mut locks = PathLocks::new();
        let real = self.real_path(dest);
        locks.lock([real.as_path()], || false)?;
        if self.db.is_valid(dest)? {
            return Ok(());
        }
        if real.exists() {
            delete_path(&real)?;
        }

        let tmp = tmp_sibling(&real);
        if tmp.exists() {
            delete_path(&tmp)?;
        }
        let mut reader = BufReader::new(spool.reopen()?);
        nar::restore_with(
            nar::ParseOptions::default().use_case_hack(self.settings.use_case_hack),
            &mut reader,
            &tmp,
        )?;
        make_read_only(&tmp)?;
        std::fs::rename(&tmp, &real)?;

        let mut info = PathInfo::new(dest.clone(), [0; 32], 0);
        fill(&mut info)?;
        self.sign_and_register(info)?;
        locks.set_deletion(true);
        info!(path = %dest, "registered");
        Ok(())
    }
}


/// `{path}.tmp`, appended (not replacing an "extension": store-path
/// names routinely contain dots).
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Clear write, setuid and setgid bits over a whole tree. Outputs
/// become immutable the moment they enter the store.
pub fn make_read_only(path: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    let mode = perms.mode() & !0o7222;
    perms.set_mode(if meta.is_dir() { mode | 0o500 } else { mode });
    std::fs::set_permissions(path, perms)?;

    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            make_read_only(&entry?.path())?;
        }
    }
    Ok(())
}

/// Delete a tree, making directories writable first so their contents
/// can be unlinked.
pub fn delete_path(path: &Path) -> Result<u64> {
    let mut freed = 0;
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o700);
        std::fs::set_permissions(path, perms)?;
        for entry in std::fs::read_dir(path)? {
            freed += delete_path(&entry?.path())?;
        }
        std::fs::remove_dir(path)?;
    } else {
        freed += meta.len();
        std::fs::remove_file(path)?;
    }
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::settings::Settings;

    use super::LocalStore;

    pub(crate) fn test_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_root(dir.path());
        let store = LocalStore::open(settings).unwrap();
        (dir, store)
    }

    #[test]
    fn add_path_roundtrip() {
        let (_dir, store) = test_store();

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("hello"), "world\n").unwrap();

        let path = store.add_path_to_store("demo", src.path()).unwrap();
        assert!(store.is_valid(&path).unwrap());
        assert_eq!(path.name(), "demo");

        let real = store.real_path(&path);
        assert_eq!(fs::read(real.join("hello")).unwrap(), b"world\n");

        // invariant 1: recorded hash matches a fresh serialization
        store.verify_path(&path).unwrap();

        // adding the identical tree lands on the identical path
        let again = store.add_path_to_store("demo", src.path()).unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn reference_scanning_links_artifacts() {
        let (_dir, store) = test_store();

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("dep"), "i am a dependency").unwrap();
        let dep = store.add_path_to_store("dep", src.path()).unwrap();

        // embed the dependency's digest into a second artifact
        let src2 = tempfile::tempdir().unwrap();
        fs::write(
            src2.path().join("script"),
            format!("#!/bin/sh\nexec {}/dep\n", store.settings.store_dir.display_path(&dep)),
        )
        .unwrap();
        let user = store.add_path_to_store("user", src2.path()).unwrap();

        let info = store.query_path_info(&user).unwrap().unwrap();
        assert!(info.references.contains(&dep));
    }

    #[test]
    fn text_paths() {
        let (_dir, store) = test_store();
        let path = store.add_text_to_store("note", b"remember me", []).unwrap();
        assert!(store.is_valid(&path).unwrap());
        store.verify_path(&path).unwrap();
        assert_eq!(
            fs::read(store.real_path(&path)).unwrap(),
            b"remember me"
        );
    }

    #[test]
    fn corrupt_import_is_rejected() {
        let (_dir, store) = test_store();

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), "payload").unwrap();
        let path = store.add_path_to_store("orig", src.path()).unwrap();
        let mut nar = vec![];
        store.nar_from_path(&path, &mut nar).unwrap();
        let mut info = store.query_path_info(&path).unwrap().unwrap();

        // fresh store; import with a wrong hash must fail cleanly
        let (_dir2, other) = test_store();
        info.nar_hash[0] ^= 0xff;
        info.ultimate = true;
        let err = other.add_from_nar(&info, nar.as_slice()).unwrap_err();
        assert!(matches!(err, crate::Error::CorruptArtifact { .. }));
        assert!(!other.is_valid(&path).unwrap());
        assert!(!other.real_path(&path).exists());
    }

    #[test]
    fn import_export_roundtrip() {
        let (_dir, store) = test_store();
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), "payload").unwrap();
        let path = store.add_path_to_store("orig", src.path()).unwrap();

        let mut nar = vec![];
        let mut info = store.nar_from_path(&path, &mut nar).unwrap();

        let (_dir2, other) = test_store();
        info.ultimate = true;
        other.add_from_nar(&info, nar.as_slice()).unwrap();
        assert!(other.is_valid(&path).unwrap());
        other.verify_path(&path).unwrap();
    }

    #[test]
    fn store_exprs_roundtrip() {
        let (_dir, store) = test_store();
        let expr = nixwire::expr::StoreExpr::Closure(Default::default());
        let path = store.write_store_expr("empty.closure", &expr).unwrap();
        assert_eq!(store.read_store_expr(&path).unwrap(), expr);
    }

    #[test]
    fn temp_roots_accumulate() {
        let (dir, store) = test_store();
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), "x").unwrap();
        let path = store.add_path_to_store("rooted", src.path()).unwrap();

        store.add_temp_root(&path).unwrap();
        let file = dir
            .path()
            .join("var/temproots")
            .join(std::process::id().to_string());
        let contents = fs::read_to_string(file).unwrap();
        assert!(contents.contains(&path.to_string()));
    }
}
