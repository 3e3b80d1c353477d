//! The SQLite lookup cache backing every remote cache.
//!
//! Two tiers: positive rows remember a parsed narinfo, negative rows
//! remember that a cache did not have a path. Rows expire by TTL;
//! expired rows are bulk-purged at most once per day, with TTL floors
//! so an aggressive refresh setting cannot wipe the cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use nixwire::narinfo::{NarInfo, Signature};
use nixwire::store_path::StorePath;

use crate::db::{epoch_now, retry_sqlite};
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
create table if not exists BinaryCaches (
    id            integer primary key autoincrement not null,
    url           text unique not null,
    timestamp     integer not null,
    storeDir      text not null,
    wantMassQuery integer not null,
    priority      integer not null
);

create table if not exists NARs (
    cache       integer not null,
    hashPart    text not null,
    namePart    text,
    url         text,
    compression text,
    fileHash    text,
    fileSize    integer,
    narHash     text,
    narSize     integer,
    refs        text,
    deriver     text,
    sigs        text,
    ca          text,
    timestamp   integer not null,
    present     integer not null,
    primary key (cache, hashPart),
    foreign key (cache) references BinaryCaches(id) on delete cascade
);

create table if not exists Realisations (
    cache     integer not null,
    outputId  text not null,
    content   blob,
    timestamp integer not null,
    primary key (cache, outputId),
    foreign key (cache) references BinaryCaches(id) on delete cascade
);

create table if not exists LastPurge (
    dummy text primary key,
    value integer
);
"#;

/// How often expired rows are purged.
const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Purge floors: even with tiny configured TTLs, the bulk purge keeps
/// rows this long.
const PURGE_FLOOR_NEGATIVE: u64 = 3600;
const PURGE_FLOOR_POSITIVE: u64 = 30 * 24 * 3600;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheInfo {
    pub id: i64,
    pub store_dir: String,
    pub want_mass_query: bool,
    pub priority: i64,
}

/// Outcome of a cached lookup.
#[derive(Debug)]
pub enum Lookup<T> {
    /// No fresh row; ask the remote.
    Unknown,
    /// Fresh negative row: the remote did not have it.
    Invalid,
    Valid(T),
}

pub struct DiskCache {
    conn: Mutex<Connection>,
    cache_ids: Mutex<HashMap<String, CacheInfo>>,
    ttl_positive: u64,
    ttl_negative: u64,
}

impl DiskCache {
    pub fn open(path: &Path, ttl_positive: u64, ttl_negative: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, ttl_positive, ttl_negative)
    }

    pub fn open_in_memory(ttl_positive: u64, ttl_negative: u64) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ttl_positive, ttl_negative)
    }

    fn init(conn: Connection, ttl_positive: u64, ttl_negative: u64) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(100))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;

        let cache = DiskCache {
            conn: Mutex::new(conn),
            cache_ids: Mutex::new(HashMap::new()),
            ttl_positive,
            ttl_negative,
        };
        cache.maybe_purge()?;
        Ok(cache)
    }

    /// All statements run under the mutex with busy retries, the same
    /// policy as the valid-paths database.
    fn with_conn<T>(&self, mut f: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("disk-cache mutex poisoned");
        Ok(retry_sqlite(|| f(&conn))?)
    }

    /// Purge expired rows, gated to once per [PURGE_INTERVAL] via the
    /// LastPurge singleton.
    fn maybe_purge(&self) -> Result<()> {
        let now = epoch_now();
        let negative_floor = now - self.ttl_negative.max(PURGE_FLOOR_NEGATIVE) as i64;
        let positive_floor = now - self.ttl_positive.max(PURGE_FLOOR_POSITIVE) as i64;

        self.with_conn(|conn| {
            let last: Option<i64> = conn
                .query_row("select value from LastPurge", [], |row| row.get(0))
                .optional()?;
            if let Some(last) = last {
                if now - last < PURGE_INTERVAL.as_secs() as i64 {
                    return Ok(());
                }
            }

            let deleted = conn.execute(
                "delete from NARs where ((present = 0 and timestamp < ?)
                                      or (present = 1 and timestamp < ?))",
                params![negative_floor, positive_floor],
            )?;
            tracing::debug!(deleted, "purged expired narinfo cache rows");

            conn.execute(
                "insert or replace into LastPurge(dummy, value) values ('', ?)",
                [now],
            )?;
            Ok(())
        })
    }

    /// Register (or refresh) a cache endpoint.
    pub fn create_cache(
        &self,
        url: &str,
        store_dir: &str,
        want_mass_query: bool,
        priority: i64,
    ) -> Result<CacheInfo> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "insert or replace into BinaryCaches(url, timestamp, storeDir, wantMassQuery, priority)
                 values (?, ?, ?, ?, ?)",
                params![url, epoch_now(), store_dir, want_mass_query, priority],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        let info = CacheInfo {
            id,
            store_dir: store_dir.to_string(),
            want_mass_query,
            priority,
        };
        self.cache_ids
            .lock()
            .expect("disk-cache mutex poisoned")
            .insert(url.to_string(), info.clone());
        Ok(info)
    }

    pub fn cache_info(&self, url: &str) -> Result<Option<CacheInfo>> {
        if let Some(info) = self
            .cache_ids
            .lock()
            .expect("disk-cache mutex poisoned")
            .get(url)
        {
            return Ok(Some(info.clone()));
        }

        let info = self.with_conn(|conn| {
            conn.query_row(
                "select id, storeDir, wantMassQuery, priority from BinaryCaches where url = ?",
                [url],
                |row| {
                    Ok(CacheInfo {
                        id: row.get(0)?,
                        store_dir: row.get(1)?,
                        want_mass_query: row.get(2)?,
                        priority: row.get(3)?,
                    })
                },
            )
            .optional()
        })?;

        if let Some(info) = &info {
            self.cache_ids
                .lock()
                .expect("disk-cache mutex poisoned")
                .insert(url.to_string(), info.clone());
        }
        Ok(info)
    }

    fn require_cache(&self, url: &str) -> Result<CacheInfo> {
        self.cache_info(url)?
            .ok_or_else(|| Error::UsageError(format!("cache {url} was never registered")))
    }

    /// Fresh lookup of a narinfo row. `refresh` treats every row as
    /// stale (without deleting it).
    pub fn lookup_nar_info(
        &self,
        cache_url: &str,
        hash_part: &str,
        refresh: bool,
    ) -> Result<Lookup<NarInfo>> {
        if refresh {
            return Ok(Lookup::Unknown);
        }
        let cache = self.require_cache(cache_url)?;
        let now = epoch_now();

        let row = self.with_conn(|conn| {
            conn.query_row(
                "select present, namePart, url, compression, fileHash, fileSize,
                        narHash, narSize, refs, deriver, sigs, ca
                 from NARs where cache = ? and hashPart = ?
                   and ((present = 0 and timestamp > ?) or (present = 1 and timestamp > ?))",
                params![
                    cache.id,
                    hash_part,
                    now - self.ttl_negative as i64,
                    now - self.ttl_positive as i64
                ],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                    ))
                },
            )
            .optional()
        })?;

        let Some((present, name, url, compression, file_hash, file_size, nar_hash, nar_size, refs, deriver, sigs, ca)) =
            row
        else {
            return Ok(Lookup::Unknown);
        };
        if !present {
            return Ok(Lookup::Invalid);
        }

        let name = name.ok_or_else(|| corrupt("namePart"))?;
        let path = StorePath::from_basename(&format!("{hash_part}-{name}"))?;

        let mut references = vec![];
        for r in refs.unwrap_or_default().split_whitespace() {
            references.push(StorePath::from_basename(r)?);
        }
        let mut signatures = vec![];
        for s in sigs.unwrap_or_default().split_whitespace() {
            signatures.push(Signature::parse(s).map_err(|_| corrupt("sigs"))?);
        }

        let info = NarInfo {
            path,
            url: url.ok_or_else(|| corrupt("url"))?,
            compression: compression
                .ok_or_else(|| corrupt("compression"))?
                .parse()
                .map_err(|_| corrupt("compression"))?,
            file_hash: file_hash
                .as_deref()
                .map(nixwire::hash::Hash::parse_any_prefixed)
                .transpose()?,
            file_size: file_size.map(|n| n as u64),
            nar_hash: nixwire::hash::Hash::parse_any_prefixed(
                nar_hash.as_deref().ok_or_else(|| corrupt("narHash"))?,
            )?
            .digest_fixed::<32>()
            .ok_or_else(|| corrupt("narHash"))?,
            nar_size: nar_size.ok_or_else(|| corrupt("narSize"))? as u64,
            references,
            deriver: deriver.as_deref().map(StorePath::from_basename).transpose()?,
            system: None,
            signatures,
            ca: ca.as_deref().map(str::parse).transpose()?,
            extra: vec![],
        };
        Ok(Lookup::Valid(info))
    }

    /// Record a positive (`Some`) or negative (`None`) lookup answer.
    /// Last writer wins, atomically per `(cache, hashPart)`.
    pub fn upsert_nar_info(
        &self,
        cache_url: &str,
        hash_part: &str,
        info: Option<&NarInfo>,
    ) -> Result<()> {
        let cache = self.require_cache(cache_url)?;
        match info {
            Some(info) => {
                let refs = info
                    .references
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                let sigs = info
                    .signatures
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.with_conn(|conn| {
                    conn.execute(
                        "insert or replace into NARs(cache, hashPart, namePart, url, compression,
                                                     fileHash, fileSize, narHash, narSize, refs,
                                                     deriver, sigs, ca, timestamp, present)
                         values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
                        params![
                            cache.id,
                            hash_part,
                            info.path.name(),
                            info.url,
                            info.compression.as_str(),
                            info.file_hash.as_ref().map(|h| h.to_prefixed_base32()),
                            info.file_size.map(|n| n as i64),
                            nixwire::hash::Hash::sha256(info.nar_hash).to_prefixed_base32(),
                            info.nar_size as i64,
                            refs,
                            info.deriver.as_ref().map(|d| d.to_string()),
                            sigs,
                            info.ca.as_ref().map(|ca| ca.to_string()),
                            epoch_now(),
                        ],
                    )
                })?;
            }
            None => {
                self.with_conn(|conn| {
                    conn.execute(
                        "insert or replace into NARs(cache, hashPart, timestamp, present)
                         values (?, ?, ?, 0)",
                        params![cache.id, hash_part, epoch_now()],
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Drop one row regardless of freshness; used after a corrupt NAR
    /// forced a re-validation.
    pub fn evict_nar_info(&self, cache_url: &str, hash_part: &str) -> Result<()> {
        let cache = self.require_cache(cache_url)?;
        self.with_conn(|conn| {
            conn.execute(
                "delete from NARs where cache = ? and hashPart = ?",
                params![cache.id, hash_part],
            )
        })?;
        Ok(())
    }

    pub fn lookup_realisation(
        &self,
        cache_url: &str,
        output_id: &str,
    ) -> Result<Lookup<serde_json::Value>> {
        let cache = self.require_cache(cache_url)?;
        let now = epoch_now();
        let row = self.with_conn(|conn| {
            conn.query_row(
                "select content from Realisations
                 where cache = ? and outputId = ?
                   and ((content is null and timestamp > ?)
                     or (content is not null and timestamp > ?))",
                params![
                    cache.id,
                    output_id,
                    now - self.ttl_negative as i64,
                    now - self.ttl_positive as i64
                ],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()
        })?;

        match row {
            None => Ok(Lookup::Unknown),
            Some(None) => Ok(Lookup::Invalid),
            Some(Some(content)) => Ok(Lookup::Valid(
                serde_json::from_slice(&content).map_err(|_| corrupt("realisation"))?,
            )),
        }
    }

    pub fn upsert_realisation(
        &self,
        cache_url: &str,
        output_id: &str,
        content: Option<&serde_json::Value>,
    ) -> Result<()> {
        let cache = self.require_cache(cache_url)?;
        let content = content.map(|c| serde_json::to_vec(c).expect("json serializes"));
        self.with_conn(|conn| {
            conn.execute(
                "insert or replace into Realisations(cache, outputId, content, timestamp)
                 values (?, ?, ?, ?)",
                params![cache.id, output_id, content, epoch_now()],
            )
        })?;
        Ok(())
    }

    /// Test hook: age one row by `seconds`.
    #[cfg(test)]
    fn age_row(&self, cache_url: &str, hash_part: &str, seconds: i64) {
        let cache = self.require_cache(cache_url).unwrap();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "update NARs set timestamp = timestamp - ? where cache = ? and hashPart = ?",
            params![seconds, cache.id, hash_part],
        )
        .unwrap();
    }
}

fn corrupt(column: &str) -> Error {
    Error::UsageError(format!("corrupt disk-cache column {column}"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use nixwire::narinfo::{Compression, NarInfo};
    use nixwire::store_path::{StoreDir, StorePath};

    use super::{DiskCache, Lookup};

    const URL: &str = "https://cache.example.org";

    fn sample_info() -> NarInfo {
        let path: StorePath = "syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin"
            .parse()
            .unwrap();
        NarInfo {
            path,
            url: "nar/05ra3y72i3qjri7xskf9qj8kb29r6naqy1sqpbs3azi3xcigmj56.nar.xz".into(),
            compression: Compression::Xz,
            file_hash: None,
            file_size: Some(68852),
            nar_hash: [7; 32],
            nar_size: 196040,
            references: vec!["0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0".parse().unwrap()],
            deriver: None,
            system: None,
            signatures: vec![],
            ca: None,
            extra: vec![],
        }
    }

    fn open() -> DiskCache {
        let cache = DiskCache::open_in_memory(30 * 24 * 3600, 3600).unwrap();
        cache.create_cache(URL, "/nix/store", true, 40).unwrap();
        cache
    }

    #[test]
    fn positive_roundtrip() {
        let cache = open();
        let info = sample_info();
        let hash_part = info.path.digest_str();

        assert!(matches!(
            cache.lookup_nar_info(URL, &hash_part, false).unwrap(),
            Lookup::Unknown
        ));

        cache.upsert_nar_info(URL, &hash_part, Some(&info)).unwrap();
        match cache.lookup_nar_info(URL, &hash_part, false).unwrap() {
            Lookup::Valid(got) => {
                let store_dir = StoreDir::default();
                assert_eq!(got.to_text(&store_dir), info.to_text(&store_dir));
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn negative_entries_expire_by_ttl() {
        let cache = open();
        let hash_part = sample_info().path.digest_str();

        cache.upsert_nar_info(URL, &hash_part, None).unwrap();
        assert!(matches!(
            cache.lookup_nar_info(URL, &hash_part, false).unwrap(),
            Lookup::Invalid
        ));

        // older than the negative TTL: treated as unknown again
        cache.age_row(URL, &hash_part, 3601);
        assert!(matches!(
            cache.lookup_nar_info(URL, &hash_part, false).unwrap(),
            Lookup::Unknown
        ));
    }

    #[test]
    fn positive_entries_outlive_negative_ttl() {
        let cache = open();
        let info = sample_info();
        let hash_part = info.path.digest_str();

        cache.upsert_nar_info(URL, &hash_part, Some(&info)).unwrap();
        cache.age_row(URL, &hash_part, 3601);
        assert!(matches!(
            cache.lookup_nar_info(URL, &hash_part, false).unwrap(),
            Lookup::Valid(_)
        ));
    }

    #[test]
    fn refresh_bypasses_rows_without_deleting() {
        let cache = open();
        let info = sample_info();
        let hash_part = info.path.digest_str();
        cache.upsert_nar_info(URL, &hash_part, Some(&info)).unwrap();

        assert!(matches!(
            cache.lookup_nar_info(URL, &hash_part, true).unwrap(),
            Lookup::Unknown
        ));
        // the row is still there for non-refresh lookups
        assert!(matches!(
            cache.lookup_nar_info(URL, &hash_part, false).unwrap(),
            Lookup::Valid(_)
        ));
    }

    #[test]
    fn negative_overwritten_by_positive() {
        let cache = open();
        let info = sample_info();
        let hash_part = info.path.digest_str();

        cache.upsert_nar_info(URL, &hash_part, None).unwrap();
        cache.upsert_nar_info(URL, &hash_part, Some(&info)).unwrap();
        assert!(matches!(
            cache.lookup_nar_info(URL, &hash_part, false).unwrap(),
            Lookup::Valid(_)
        ));
    }

    #[test]
    fn eviction() {
        let cache = open();
        let info = sample_info();
        let hash_part = info.path.digest_str();
        cache.upsert_nar_info(URL, &hash_part, Some(&info)).unwrap();
        cache.evict_nar_info(URL, &hash_part).unwrap();
        assert!(matches!(
            cache.lookup_nar_info(URL, &hash_part, false).unwrap(),
            Lookup::Unknown
        ));
    }

    #[test]
    fn cache_identity_round_trips() {
        let cache = open();
        let info = cache.cache_info(URL).unwrap().unwrap();
        assert_eq!(info.store_dir, "/nix/store");
        assert!(info.want_mass_query);
        assert_eq!(info.priority, 40);
        assert!(cache.cache_info("https://other.example").unwrap().is_none());
    }

    #[test]
    fn realisations() {
        let cache = open();
        let value = serde_json::json!({"outPath": "x"});

        assert!(matches!(
            cache.lookup_realisation(URL, "sha256:abc!out").unwrap(),
            Lookup::Unknown
        ));
        cache.upsert_realisation(URL, "sha256:abc!out", Some(&value)).unwrap();
        match cache.lookup_realisation(URL, "sha256:abc!out").unwrap() {
            Lookup::Valid(got) => assert_eq!(got, value),
            other => panic!("expected Valid, got {other:?}"),
        }
        cache.upsert_realisation(URL, "sha256:abc!out", None).unwrap();
        assert!(matches!(
            cache.lookup_realisation(URL, "sha256:abc!out").unwrap(),
            Lookup::Invalid
        ));
    }
}
