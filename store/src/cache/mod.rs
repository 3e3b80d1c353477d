//! Binary caches: remote stores of compressed archives plus narinfo
//! metadata, layered over a pluggable object backend and the SQLite
//! lookup cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, instrument};

use nixwire::hash::{hash_bytes, Algo};
use nixwire::narinfo::{Compression, NarInfo, SigningKey, VerifyingKey};
use nixwire::store_path::{StoreDir, StorePath};

use crate::error::{Error, Result};
use crate::local::LocalStore;
use crate::settings::Settings;

pub mod backend;
pub mod disk_cache;
pub mod http;
pub mod ipfs;
pub mod local;
pub mod s3;

pub use backend::CacheBackend;
pub use disk_cache::{DiskCache, Lookup};
pub use http::HttpCacheBackend;
pub use ipfs::IpfsCacheBackend;
pub use local::LocalCacheBackend;
pub use s3::S3CacheBackend;

pub const CACHE_INFO_KEY: &str = "nix-cache-info";

/// Per-cache operation counters; the `averted` pair witnesses the
/// dedup point on the write path.
#[derive(Debug, Default)]
pub struct Stats {
    pub nar_info_read: AtomicU64,
    pub nar_info_read_averted: AtomicU64,
    pub nar_info_missing: AtomicU64,
    pub nar_info_write: AtomicU64,
    pub nar_write: AtomicU64,
    pub nar_write_averted: AtomicU64,
    pub nar_write_bytes: AtomicU64,
    pub nar_write_compressed_bytes: AtomicU64,
    pub nar_read: AtomicU64,
}

pub struct BinaryCacheStore {
    backend: Box<dyn CacheBackend>,
    store_dir: StoreDir,
    disk_cache: Option<Arc<DiskCache>>,
    signing_keys: Vec<SigningKey>,
    trusted_keys: Vec<VerifyingKey>,
    require_sigs: bool,
    compression: Compression,
    /// Treat disk-cache rows as stale for this store's lookups.
    refresh: bool,
    pub want_mass_query: bool,
    pub priority: i64,
    stats: Stats,
}

impl BinaryCacheStore {
    /// Open a cache over `backend`, reading `nix-cache-info` (writing
    /// it on first use) and registering the cache in the disk cache.
    #[instrument(skip_all, fields(url = %backend.url()))]
    pub async fn open(
        backend: Box<dyn CacheBackend>,
        settings: &Settings,
        disk_cache: Option<Arc<DiskCache>>,
        signing_keys: Vec<SigningKey>,
        trusted_keys: Vec<VerifyingKey>,
    ) -> Result<Self> {
        let (store_dir_line, want_mass_query, priority) =
            match backend.get_file(CACHE_INFO_KEY).await {
                Ok(data) => parse_cache_info(std::str::from_utf8(&data).map_err(|_| {
                    Error::UsageError("nix-cache-info is not UTF-8".to_string())
                })?),
                Err(Error::NoSuchCacheFile(_)) => {
                    let contents = format!(
                        "StoreDir: {}\nWantMassQuery: 1\nPriority: 50\n",
                        settings.store_dir
                    );
                    backend
                        .upsert_file(CACHE_INFO_KEY, contents.into_bytes(), "text/x-nix-cache-info")
                        .await?;
                    (Some(settings.store_dir.to_string()), true, 50)
                }
                Err(e) => return Err(e),
            };

        if let Some(remote_store_dir) = &store_dir_line {
            if *remote_store_dir != settings.store_dir.to_string() {
                return Err(Error::UsageError(format!(
                    "cache {} serves store dir {remote_store_dir}, not {}",
                    backend.url(),
                    settings.store_dir
                )));
            }
        }

        if let Some(disk_cache) = &disk_cache {
            disk_cache.create_cache(
                &backend.url(),
                settings.store_dir.as_str(),
                want_mass_query,
                priority,
            )?;
        }

        Ok(BinaryCacheStore {
            backend,
            store_dir: settings.store_dir.clone(),
            disk_cache,
            signing_keys,
            trusted_keys,
            require_sigs: settings.require_sigs,
            compression: Compression::Xz,
            refresh: false,
            want_mass_query,
            priority,
            stats: Stats::default(),
        })
    }

    pub fn url(&self) -> String {
        self.backend.url()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    /// Skip the freshness check on disk-cache rows for subsequent
    /// lookups. Rows are only ever deleted by the periodic purge.
    pub fn set_refresh(&mut self, refresh: bool) {
        self.refresh = refresh;
    }

    /// The read path: disk cache first, then the remote. `Ok(None)`
    /// means the cache does not have the path.
    #[instrument(skip(self), fields(path = %path, cache = %self.backend.url()))]
    pub async fn query_path_info(&self, path: &StorePath) -> Result<Option<NarInfo>> {
        let hash_part = path.digest_str();

        if let Some(disk_cache) = &self.disk_cache {
            match disk_cache.lookup_nar_info(&self.backend.url(), &hash_part, self.refresh)? {
                Lookup::Valid(info) => {
                    self.stats.nar_info_read_averted.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(info));
                }
                Lookup::Invalid => {
                    self.stats.nar_info_read_averted.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Lookup::Unknown => {}
            }
        }

        let key = NarInfo::key_for(path);
        let text = match self.backend.get_file(&key).await {
            Ok(data) => data,
            Err(Error::NoSuchCacheFile(_)) => {
                self.stats.nar_info_missing.fetch_add(1, Ordering::Relaxed);
                if let Some(disk_cache) = &self.disk_cache {
                    disk_cache.upsert_nar_info(&self.backend.url(), &hash_part, None)?;
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.stats.nar_info_read.fetch_add(1, Ordering::Relaxed);

        let text = String::from_utf8(text)
            .map_err(|_| Error::UsageError(format!("narinfo {key} is not UTF-8")))?;
        let info = NarInfo::parse(&self.store_dir, &text)?;

        if info.path != *path {
            return Err(Error::UsageError(format!(
                "narinfo {key} describes {}, expected {path}",
                info.path
            )));
        }
        self.check_trust(&info)?;

        if let Some(disk_cache) = &self.disk_cache {
            disk_cache.upsert_nar_info(&self.backend.url(), &hash_part, Some(&info))?;
        }
        Ok(Some(info))
    }

    fn check_trust(&self, info: &NarInfo) -> Result<()> {
        if !self.require_sigs || info.ca.is_some() {
            return Ok(());
        }
        if info.check_signatures(&self.store_dir, &self.trusted_keys) {
            return Ok(());
        }
        Err(Error::SignatureMismatch(info.path.clone()))
    }

    /// A reader over the decompressed archive bytes of `info`.
    pub async fn nar_reader(&self, info: &NarInfo) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        self.stats.nar_read.fetch_add(1, Ordering::Relaxed);
        let raw = self.backend.get_file_reader(&info.url).await?;
        Ok(decompress(info.compression, raw))
    }

    /// Materialize `path` from this cache into the local store,
    /// verifying the archive hash while restoring. A mismatch
    /// surfaces as [Error::CorruptArtifact] after the stream is fully
    /// read; the entry is *not* evicted automatically (see
    /// [refresh_entry](Self::refresh_entry)).
    #[instrument(skip(self, local), fields(path = %path))]
    pub async fn fetch_into(&self, local: &LocalStore, path: &StorePath) -> Result<()> {
        let info = self
            .query_path_info(path)
            .await?
            .ok_or_else(|| Error::InvalidPath(path.clone()))?;

        let reader = self.nar_reader(&info).await?;
        let path_info = info.to_path_info(0);
        tokio::task::block_in_place(|| local.add_from_nar(&path_info, SyncIoBridge::new(reader)))
    }

    /// Forget the disk-cache row for `path` so the next lookup hits
    /// the remote again.
    pub fn refresh_entry(&self, path: &StorePath) -> Result<()> {
        if let Some(disk_cache) = &self.disk_cache {
            disk_cache.evict_nar_info(&self.backend.url(), &path.digest_str())?;
        }
        Ok(())
    }

    /// The write path: compress, dedup on the compressed object,
    /// write narinfo, warm the disk cache.
    #[instrument(skip(self, local), fields(path = %path, cache = %self.backend.url()))]
    pub async fn push(&self, local: &LocalStore, path: &StorePath) -> Result<()> {
        let narinfo_key = NarInfo::key_for(path);
        if self.backend.file_exists(&narinfo_key).await? {
            debug!("narinfo already present");
            return Ok(());
        }

        // serialize and verify against the local record
        let mut nar = Vec::new();
        let info = tokio::task::block_in_place(|| local.nar_from_path(path, &mut nar))?;

        let compressed = compress(self.compression, &nar).await?;
        let file_hash = hash_bytes(Algo::Sha256, &compressed);
        let nar_key = format!(
            "nar/{}.nar{}",
            file_hash.to_base32(),
            self.compression.extension()
        );

        self.stats.nar_write_bytes.fetch_add(nar.len() as u64, Ordering::Relaxed);
        // identical archives land on identical keys: the dedup point
        if self.backend.file_exists(&nar_key).await? {
            self.stats.nar_write_averted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.nar_write.fetch_add(1, Ordering::Relaxed);
            self.stats
                .nar_write_compressed_bytes
                .fetch_add(compressed.len() as u64, Ordering::Relaxed);
            self.backend
                .upsert_file(&nar_key, compressed.clone(), "application/x-nix-nar")
                .await?;
        }

        let mut narinfo = NarInfo::from_path_info(
            &info,
            nar_key,
            self.compression,
            Some(file_hash),
            Some(compressed.len() as u64),
        );
        for key in &self.signing_keys {
            narinfo.add_signature(&self.store_dir, key);
        }

        self.stats.nar_info_write.fetch_add(1, Ordering::Relaxed);
        self.backend
            .upsert_file(
                &narinfo_key,
                narinfo.to_text(&self.store_dir).into_bytes(),
                "text/x-nix-narinfo",
            )
            .await?;

        if let Some(disk_cache) = &self.disk_cache {
            disk_cache.upsert_nar_info(&self.backend.url(), &path.digest_str(), Some(&narinfo))?;
        }
        info!(size = nar.len(), "pushed");
        Ok(())
    }

    /// Push `path` and everything it references, references first, so
    /// a partially-pushed cache stays closed under references.
    pub async fn push_closure(&self, local: &LocalStore, path: &StorePath) -> Result<()> {
        let closure = tokio::task::block_in_place(|| {
            crate::closure::compute_fs_closure(
                &local.db,
                [path.clone()],
                local.settings.closure_workers,
            )
        })?;

        // post-order over the reference edges
        let mut ordered: Vec<StorePath> = vec![];
        let mut done: std::collections::BTreeSet<StorePath> = Default::default();
        let mut stack: Vec<(StorePath, bool)> = closure.iter().cloned().map(|p| (p, false)).collect();
        while let Some((path, expanded)) = stack.pop() {
            if done.contains(&path) {
                continue;
            }
            if expanded {
                done.insert(path.clone());
                ordered.push(path);
                continue;
            }
            stack.push((path.clone(), true));
            if let Some(info) = local.query_path_info(&path)? {
                for reference in info.references {
                    if reference != path && !done.contains(&reference) {
                        stack.push((reference, false));
                    }
                }
            }
        }

        for path in &ordered {
            self.push(local, path).await?;
        }
        Ok(())
    }

    /// Upload the build log of a derivation, keyed by the deriver's
    /// digest part.
    pub async fn upload_build_log(&self, deriver: &StorePath, log: Vec<u8>) -> Result<()> {
        self.backend
            .upsert_file(&format!("log/{}", deriver.digest_str()), log, "text/plain")
            .await
    }

    pub async fn get_build_log(&self, deriver: &StorePath) -> Result<Option<Vec<u8>>> {
        match self
            .backend
            .get_file(&format!("log/{}", deriver.digest_str()))
            .await
        {
            Ok(log) => Ok(Some(log)),
            Err(Error::NoSuchCacheFile(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store a realisation record (content-addressed derivation
    /// output) under `realisations/{output-id}.doi`.
    pub async fn push_realisation(
        &self,
        output_id: &str,
        realisation: &serde_json::Value,
    ) -> Result<()> {
        let key = format!("realisations/{output_id}.doi");
        self.backend
            .upsert_file(
                &key,
                serde_json::to_vec(realisation)
                    .map_err(|e| Error::UsageError(format!("unserializable realisation: {e}")))?,
                "application/json",
            )
            .await?;
        if let Some(disk_cache) = &self.disk_cache {
            disk_cache.upsert_realisation(&self.backend.url(), output_id, Some(realisation))?;
        }
        Ok(())
    }

    pub async fn query_realisation(&self, output_id: &str) -> Result<Option<serde_json::Value>> {
        if let Some(disk_cache) = &self.disk_cache {
            match disk_cache.lookup_realisation(&self.backend.url(), output_id)? {
                Lookup::Valid(value) => return Ok(Some(value)),
                Lookup::Invalid => return Ok(None),
                Lookup::Unknown => {}
            }
        }

        let key = format!("realisations/{output_id}.doi");
        let value = match self.backend.get_file(&key).await {
            Ok(data) => Some(serde_json::from_slice(&data).map_err(|e| {
                Error::UsageError(format!("malformed realisation at {key}: {e}"))
            })?),
            Err(Error::NoSuchCacheFile(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some(disk_cache) = &self.disk_cache {
            disk_cache.upsert_realisation(&self.backend.url(), output_id, value.as_ref())?;
        }
        Ok(value)
    }

    pub async fn sync(&self) -> Result<()> {
        self.backend.sync().await
    }
}

fn parse_cache_info(text: &str) -> (Option<String>, bool, i64) {
    let mut store_dir = None;
    let mut want_mass_query = false;
    let mut priority = 50;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "StoreDir" => store_dir = Some(value.to_string()),
            "WantMassQuery" => want_mass_query = value == "1",
            "Priority" => priority = value.parse().unwrap_or(50),
            _ => {}
        }
    }
    (store_dir, want_mass_query, priority)
}

async fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    use async_compression::tokio::bufread;

    let mut out = Vec::new();
    match compression {
        Compression::None => out.extend_from_slice(data),
        Compression::Xz => {
            bufread::XzEncoder::new(data).read_to_end(&mut out).await?;
        }
        Compression::Bzip2 => {
            bufread::BzEncoder::new(data).read_to_end(&mut out).await?;
        }
        Compression::Gzip => {
            bufread::GzipEncoder::new(data).read_to_end(&mut out).await?;
        }
        Compression::Zstd => {
            bufread::ZstdEncoder::new(data).read_to_end(&mut out).await?;
        }
        Compression::Brotli => {
            bufread::BrotliEncoder::new(data).read_to_end(&mut out).await?;
        }
    }
    Ok(out)
}

fn decompress(
    compression: Compression,
    reader: Box<dyn AsyncRead + Send + Unpin>,
) -> Box<dyn AsyncRead + Send + Unpin> {
    use async_compression::tokio::bufread;

    let buffered = BufReader::new(reader);
    match compression {
        Compression::None => Box::new(buffered),
        Compression::Xz => Box::new(bufread::XzDecoder::new(buffered)),
        Compression::Bzip2 => Box::new(bufread::BzDecoder::new(buffered)),
        Compression::Gzip => Box::new(bufread::GzipDecoder::new(buffered)),
        Compression::Zstd => Box::new(bufread::ZstdDecoder::new(buffered)),
        Compression::Brotli => Box::new(bufread::BrotliDecoder::new(buffered)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use nixwire::narinfo::Compression;

    use crate::cache::local::LocalCacheBackend;
    use crate::cache::{BinaryCacheStore, DiskCache};
    use crate::local::LocalStore;
    use crate::settings::Settings;
    use crate::Error;

    async fn cache_over(
        dir: &std::path::Path,
        settings: &Settings,
        disk_cache: Option<Arc<DiskCache>>,
    ) -> BinaryCacheStore {
        let backend = Box::new(LocalCacheBackend::new(dir).unwrap());
        BinaryCacheStore::open(backend, settings, disk_cache, vec![], vec![])
            .await
            .unwrap()
    }

    fn local_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::with_root(dir.path());
        settings.require_sigs = false;
        let store = LocalStore::open(settings).unwrap();
        (dir, store)
    }

    fn add_sample(store: &LocalStore, name: &str, contents: &str) -> nixwire::StorePath {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("f"), contents).unwrap();
        store.add_path_to_store(name, src.path()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_then_fetch_roundtrip() {
        let (_dir, store) = local_store();
        let path = add_sample(&store, "hello", "hello cache\n");

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = cache_over(cache_dir.path(), &store.settings, None).await;
        cache.push(&store, &path).await.unwrap();

        // cache layout: nix-cache-info, narinfo, compressed nar
        assert!(cache_dir.path().join("nix-cache-info").exists());
        assert!(cache_dir
            .path()
            .join(format!("{}.narinfo", path.digest_str()))
            .exists());

        let info = cache.query_path_info(&path).await.unwrap().unwrap();
        assert_eq!(info.compression, Compression::Xz);

        // restore into a second store
        let (_dir2, other) = local_store();
        let cache2 = cache_over(cache_dir.path(), &other.settings, None).await;
        cache2.fetch_into(&other, &path).await.unwrap();
        assert!(other.is_valid(&path).unwrap());
        other.verify_path(&path).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_nars_are_deduplicated() {
        let (_dir, store) = local_store();
        // two names, identical trees, identical archives
        let a = add_sample(&store, "copy-a", "same bytes");
        let b = add_sample(&store, "copy-b", "same bytes");

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = cache_over(cache_dir.path(), &store.settings, None).await;
        cache.push(&store, &a).await.unwrap();
        cache.push(&store, &b).await.unwrap();

        assert_eq!(cache.stats().nar_write.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().nar_write_averted.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().nar_info_write.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn negative_lookups_are_cached() {
        let (_dir, store) = local_store();
        let path = add_sample(&store, "absent", "never pushed");

        let cache_dir = tempfile::tempdir().unwrap();
        let disk_cache = Arc::new(DiskCache::open_in_memory(30 * 24 * 3600, 3600).unwrap());
        let cache = cache_over(cache_dir.path(), &store.settings, Some(disk_cache)).await;

        assert!(cache.query_path_info(&path).await.unwrap().is_none());
        assert_eq!(cache.stats().nar_info_missing.load(Ordering::Relaxed), 1);

        // second query answered from the disk cache
        assert!(cache.query_path_info(&path).await.unwrap().is_none());
        assert_eq!(cache.stats().nar_info_missing.load(Ordering::Relaxed), 1);
        assert_eq!(
            cache.stats().nar_info_read_averted.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_nar_is_detected_on_fetch() {
        let (_dir, store) = local_store();
        let path = add_sample(&store, "victim", "precious data");

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = cache_over(cache_dir.path(), &store.settings, None).await;
        cache.push(&store, &path).await.unwrap();

        // corrupt the narinfo's recorded hash rather than the object,
        // so decompression still succeeds
        let narinfo_path = cache_dir.path().join(format!("{}.narinfo", path.digest_str()));
        let text = std::fs::read_to_string(&narinfo_path).unwrap();
        let tampered: String = text
            .lines()
            .map(|l| {
                if let Some(rest) = l.strip_prefix("NarHash: sha256:") {
                    let flipped = if rest.starts_with('0') { "1" } else { "0" };
                    format!("NarHash: sha256:{flipped}{}\n", &rest[1..])
                } else {
                    format!("{l}\n")
                }
            })
            .collect();
        std::fs::write(&narinfo_path, tampered).unwrap();

        let (_dir2, other) = local_store();
        let cache2 = cache_over(cache_dir.path(), &other.settings, None).await;
        let err = cache2.fetch_into(&other, &path).await.unwrap_err();
        assert!(matches!(err, Error::CorruptArtifact { .. }));
        assert!(!other.is_valid(&path).unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn build_logs_and_realisations() {
        let (_dir, store) = local_store();
        let drv = add_sample(&store, "thing.drv", "fake recipe");

        let cache_dir = tempfile::tempdir().unwrap();
        let disk_cache = Arc::new(DiskCache::open_in_memory(30 * 24 * 3600, 3600).unwrap());
        let cache = cache_over(cache_dir.path(), &store.settings, Some(disk_cache)).await;

        assert!(cache.get_build_log(&drv).await.unwrap().is_none());
        cache.upload_build_log(&drv, b"compiling...\n".to_vec()).await.unwrap();
        assert_eq!(
            cache.get_build_log(&drv).await.unwrap().unwrap(),
            b"compiling...\n"
        );

        let realisation = serde_json::json!({"outPath": "xyz"});
        assert!(cache.query_realisation("sha256:aa!out").await.unwrap().is_none());
        cache.push_realisation("sha256:aa!out", &realisation).await.unwrap();
        assert_eq!(
            cache.query_realisation("sha256:aa!out").await.unwrap(),
            Some(realisation)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_closure_pushes_references_too() {
        let (_dir, store) = local_store();
        let dep = add_sample(&store, "dep", "the dependency");

        let src = tempfile::tempdir().unwrap();
        std::fs::write(
            src.path().join("link"),
            store.settings.store_dir.display_path(&dep),
        )
        .unwrap();
        let root = store.add_path_to_store("root", src.path()).unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = cache_over(cache_dir.path(), &store.settings, None).await;
        cache.push_closure(&store, &root).await.unwrap();

        for p in [&dep, &root] {
            assert!(cache.query_path_info(p).await.unwrap().is_some());
        }
    }
}
