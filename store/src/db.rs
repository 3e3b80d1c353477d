//! The valid-paths database: the authoritative record of what exists
//! in the local store.
//!
//! All mutation happens inside single-writer `BEGIN IMMEDIATE`
//! transactions; busy errors are retried with exponential backoff.
//! The connection is per-process and serialized behind a mutex.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use nixwire::hash::{Algo, Hash};
use nixwire::narinfo::Signature;
use nixwire::path_info::PathInfo;
use nixwire::store_path::StorePath;

use crate::error::{Error, Result};

const SCHEMA: &str = r#"
create table if not exists ValidPaths (
    id               integer primary key autoincrement not null,
    path             text unique not null,
    hash             text not null,
    registrationTime integer not null,
    deriver          text,
    narSize          integer,
    ultimate         integer not null default 0,
    sigs             text,
    ca               text
);

create table if not exists Refs (
    referrer  integer not null,
    reference integer not null,
    primary key (referrer, reference),
    foreign key (referrer) references ValidPaths(id) on delete cascade,
    foreign key (reference) references ValidPaths(id) on delete restrict
);

create index if not exists IndexReferrer on Refs(referrer);
create index if not exists IndexReference on Refs(reference);

create table if not exists DerivationOutputs (
    drv  integer not null,
    id   text not null,
    path text not null,
    primary key (drv, id),
    foreign key (drv) references ValidPaths(id) on delete cascade
);

create index if not exists IndexDerivationOutputs on DerivationOutputs(path);

create table if not exists Successors (
    drv       text primary key not null,
    successor text not null
);

create table if not exists Substitutes (
    path      text not null,
    storeExpr text not null,
    program   text not null,
    args      text not null,
    priority  integer not null,
    primary key (path, storeExpr, program, args)
);

create table if not exists Realisations (
    id         integer primary key autoincrement not null,
    drvPath    text not null,
    outputName text not null,
    outputPath text not null,
    signatures text,
    unique (drvPath, outputName)
);

create table if not exists RealisationsRefs (
    referrer             integer not null,
    realisationReference integer not null,
    foreign key (referrer) references Realisations(id) on delete cascade,
    foreign key (realisationReference) references Realisations(id) on delete restrict
);
"#;

/// A registered way to materialize one store path: run `program` (a
/// path relative to the root of `store_expr`'s closure) with `args`
/// plus the target path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Substitute {
    pub store_expr: StorePath,
    pub program: String,
    pub args: Vec<String>,
    pub priority: i64,
}

/// A content-addressed derivation output record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Realisation {
    pub drv_path: StorePath,
    pub output_name: String,
    pub output_path: StorePath,
    pub signatures: Vec<Signature>,
}

pub struct Db {
    conn: Mutex<Connection>,
}

/// Retry policy for `SQLITE_BUSY`: exponential backoff from 1ms,
/// capped per-try, bounded in total.
pub(crate) fn retry_sqlite<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut delay = Duration::from_millis(1);
    let mut total = Duration::ZERO;
    loop {
        match f() {
            Err(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) && total < Duration::from_secs(60) =>
            {
                std::thread::sleep(delay);
                total += delay;
                delay = (delay * 2).min(Duration::from_millis(100));
            }
            other => return other,
        }
    }
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(100))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        // journal_mode returns the resulting mode as a row
        conn.pragma_update_and_check(None, "journal_mode", "wal", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnMut(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let mut f = f;
        Ok(retry_sqlite(|| f(&mut conn))?)
    }

    pub fn is_valid(&self, path: &StorePath) -> Result<bool> {
        let path = path.to_string();
        self.with_conn(|conn| {
            conn.query_row(
                "select 1 from ValidPaths where path = ?",
                [&path],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    pub fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>> {
        let path_str = path.to_string();
        let row = self.with_conn(|conn| {
            conn.query_row(
                "select id, hash, registrationTime, deriver, narSize, ultimate, sigs, ca
                 from ValidPaths where path = ?",
                [&path_str],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()
        })?;

        let Some((id, hash, registration_time, deriver, nar_size, ultimate, sigs, ca)) = row
        else {
            return Ok(None);
        };

        let nar_hash = Hash::parse(&hash, Some(Algo::Sha256))?
            .digest_fixed::<32>()
            .ok_or_else(|| Error::UsageError(format!("corrupt hash column for {path}")))?;

        let mut info = PathInfo::new(path.clone(), nar_hash, nar_size.unwrap_or(0) as u64);
        info.registration_time = registration_time;
        info.ultimate = ultimate;
        info.deriver = deriver.as_deref().map(StorePath::from_basename).transpose()?;
        info.ca = ca.as_deref().map(str::parse).transpose()?;
        if let Some(sigs) = sigs {
            for sig in sigs.split_whitespace() {
                info.signatures.push(
                    Signature::parse(sig)
                        .map_err(|e| Error::UsageError(format!("corrupt sigs column: {e}")))?,
                );
            }
        }

        info.references = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "select p.path from Refs r join ValidPaths p on r.reference = p.id
                 where r.referrer = ?",
            )?;
            let rows = stmt.query_map([id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?
        .iter()
        .map(|s| StorePath::from_basename(s))
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;

        Ok(Some(info))
    }

    /// Inverse of `references`.
    pub fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let path_str = path.to_string();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "select p2.path from ValidPaths p
                 join Refs r on r.reference = p.id
                 join ValidPaths p2 on r.referrer = p2.id
                 where p.path = ?",
            )?;
            let rows = stmt.query_map([&path_str], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?
        .iter()
        .map(|s| Ok(StorePath::from_basename(s)?))
        .collect()
    }

    pub fn query_valid_paths(&self) -> Result<Vec<StorePath>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("select path from ValidPaths order by path")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?
        .iter()
        .map(|s| Ok(StorePath::from_basename(s)?))
        .collect()
    }

    /// Transactionally insert one or more path-info records together
    /// with their reference edges. Either every record becomes
    /// observable or none does. References must resolve to valid paths
    /// or to members of the batch.
    pub fn register_valid_paths(&self, infos: &[PathInfo]) -> Result<()> {
        let now = epoch_now();
        self.with_conn(|conn| {
            let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            insert_path_infos(&txn, infos, now)?;
            txn.commit()
        })?;
        Ok(())
    }

    /// Register a build's outputs, its derivation-output rows and the
    /// successor mapping in one transaction: after a crash, either the
    /// build happened or it didn't.
    pub fn register_build_results(
        &self,
        infos: &[PathInfo],
        drv: &StorePath,
        successor: &StorePath,
    ) -> Result<()> {
        let now = epoch_now();
        let drv_str = drv.to_string();
        let successor_str = successor.to_string();
        self.with_conn(|conn| {
            let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            insert_path_infos(&txn, infos, now)?;
            for (i, info) in infos.iter().enumerate() {
                let output_name = if i == 0 {
                    "out".to_string()
                } else {
                    format!("out{i}")
                };
                txn.execute(
                    "insert or replace into DerivationOutputs(drv, id, path)
                     select id, ?2, ?3 from ValidPaths where path = ?1",
                    params![drv_str, output_name, info.path.to_string()],
                )?;
            }
            txn.execute(
                "insert or replace into Successors(drv, successor) values (?, ?)",
                [&drv_str, &successor_str],
            )?;
            txn.commit()
        })?;
        Ok(())
    }

    /// Remove paths from the database, in one transaction. Fails if a
    /// surviving path still references one of them.
    pub fn invalidate(&self, paths: &[StorePath]) -> Result<()> {
        let names: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        self.with_conn(|conn| {
            let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for name in &names {
                txn.execute(
                    "delete from Refs where referrer in (select id from ValidPaths where path = ?)",
                    [name],
                )?;
            }
            for name in &names {
                txn.execute("delete from ValidPaths where path = ?", [name])?;
            }
            txn.commit()
        })?;
        Ok(())
    }

    pub fn register_successor(&self, drv: &StorePath, successor: &StorePath) -> Result<()> {
        let (drv, successor) = (drv.to_string(), successor.to_string());
        self.with_conn(|conn| {
            conn.execute(
                "insert or replace into Successors(drv, successor) values (?, ?)",
                [&drv, &successor],
            )
        })?;
        Ok(())
    }

    pub fn query_successor(&self, drv: &StorePath) -> Result<Option<StorePath>> {
        let drv = drv.to_string();
        let row = self.with_conn(|conn| {
            conn.query_row(
                "select successor from Successors where drv = ?",
                [&drv],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })?;
        Ok(row.as_deref().map(StorePath::from_basename).transpose()?)
    }

    pub fn unregister_successor(&self, drv: &StorePath) -> Result<()> {
        let drv = drv.to_string();
        self.with_conn(|conn| conn.execute("delete from Successors where drv = ?", [&drv]))?;
        Ok(())
    }

    /// Record `path` as an output of the (valid) derivation `drv`.
    pub fn register_derivation_output(
        &self,
        drv: &StorePath,
        output_name: &str,
        path: &StorePath,
    ) -> Result<()> {
        let (drv, path) = (drv.to_string(), path.to_string());
        self.with_conn(|conn| {
            conn.execute(
                "insert or replace into DerivationOutputs(drv, id, path)
                 select id, ?2, ?3 from ValidPaths where path = ?1",
                params![drv, output_name, path],
            )
        })?;
        Ok(())
    }

    pub fn query_derivation_outputs(&self, drv: &StorePath) -> Result<Vec<StorePath>> {
        let drv = drv.to_string();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "select d.path from DerivationOutputs d
                 join ValidPaths p on d.drv = p.id where p.path = ?",
            )?;
            let rows = stmt.query_map([&drv], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?
        .iter()
        .map(|s| Ok(StorePath::from_basename(s)?))
        .collect()
    }

    pub fn register_substitute(&self, path: &StorePath, substitute: &Substitute) -> Result<()> {
        let path = path.to_string();
        self.with_conn(|conn| {
            conn.execute(
                "insert or replace into Substitutes(path, storeExpr, program, args, priority)
                 values (?, ?, ?, ?, ?)",
                params![
                    path,
                    substitute.store_expr.to_string(),
                    substitute.program,
                    serde_json::to_string(&substitute.args).expect("args serialize"),
                    substitute.priority,
                ],
            )
        })?;
        Ok(())
    }

    /// Substitutes for `path`, best priority first.
    pub fn query_substitutes(&self, path: &StorePath) -> Result<Vec<Substitute>> {
        let path_str = path.to_string();
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "select storeExpr, program, args, priority from Substitutes
                 where path = ? order by priority asc, rowid asc",
            )?;
            let rows = stmt.query_map([&path_str], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        rows.into_iter()
            .map(|(store_expr, program, args, priority)| {
                Ok(Substitute {
                    store_expr: StorePath::from_basename(&store_expr)?,
                    program,
                    args: serde_json::from_str(&args)
                        .map_err(|e| Error::UsageError(format!("corrupt substitute args: {e}")))?,
                    priority,
                })
            })
            .collect()
    }

    pub fn register_realisation(&self, realisation: &Realisation) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "insert or replace into Realisations(drvPath, outputName, outputPath, signatures)
                 values (?, ?, ?, ?)",
                params![
                    realisation.drv_path.to_string(),
                    realisation.output_name,
                    realisation.output_path.to_string(),
                    join_sigs(&realisation.signatures),
                ],
            )
        })?;
        Ok(())
    }

    pub fn query_realisation(
        &self,
        drv_path: &StorePath,
        output_name: &str,
    ) -> Result<Option<Realisation>> {
        let drv = drv_path.to_string();
        let row = self.with_conn(|conn| {
            conn.query_row(
                "select outputPath, signatures from Realisations
                 where drvPath = ? and outputName = ?",
                params![drv, output_name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
        })?;

        let Some((output_path, signatures)) = row else {
            return Ok(None);
        };
        let mut sigs = vec![];
        if let Some(signatures) = signatures {
            for sig in signatures.split_whitespace() {
                sigs.push(
                    Signature::parse(sig)
                        .map_err(|e| Error::UsageError(format!("corrupt sigs column: {e}")))?,
                );
            }
        }
        Ok(Some(Realisation {
            drv_path: drv_path.clone(),
            output_name: output_name.to_string(),
            output_path: StorePath::from_basename(&output_path)?,
            signatures: sigs,
        }))
    }
}

/// Insert records and their reference edges. Records first, so
/// in-batch references resolve; a reference outside both the batch and
/// the table aborts the transaction.
fn insert_path_infos(
    txn: &rusqlite::Transaction<'_>,
    infos: &[PathInfo],
    now: i64,
) -> rusqlite::Result<()> {
    for info in infos {
        let time = if info.registration_time != 0 {
            info.registration_time
        } else {
            now
        };
        txn.execute(
            "insert into ValidPaths(path, hash, registrationTime, deriver, narSize, ultimate, sigs, ca)
             values (?, ?, ?, ?, ?, ?, ?, ?)
             on conflict(path) do update set
                 hash = excluded.hash,
                 narSize = excluded.narSize,
                 ultimate = max(ultimate, excluded.ultimate),
                 sigs = excluded.sigs,
                 ca = excluded.ca",
            params![
                info.path.to_string(),
                info.nar_hash().to_prefixed_base32(),
                time,
                info.deriver.as_ref().map(|d| d.to_string()),
                info.nar_size as i64,
                info.ultimate,
                join_sigs(&info.signatures),
                info.ca.as_ref().map(|ca| ca.to_string()),
            ],
        )?;
    }
    for info in infos {
        let referrer: i64 = txn.query_row(
            "select id from ValidPaths where path = ?",
            [info.path.to_string()],
            |row| row.get(0),
        )?;
        txn.execute("delete from Refs where referrer = ?", [referrer])?;
        for reference in &info.references {
            txn.execute(
                "insert or ignore into Refs(referrer, reference)
                 select ?, id from ValidPaths where path = ?",
                params![referrer, reference.to_string()],
            )?;
            if txn.changes() == 0 {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                    Some(format!(
                        "reference {reference} of {} is not valid",
                        info.path
                    )),
                ));
            }
        }
    }
    Ok(())
}

fn join_sigs(sigs: &[Signature]) -> Option<String> {
    if sigs.is_empty() {
        None
    } else {
        Some(
            sigs.iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

pub(crate) fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use nixwire::path_info::PathInfo;
    use nixwire::store_path::StorePath;

    use super::{Db, Substitute};

    fn path(c: char, name: &str) -> StorePath {
        let digest: String = std::iter::repeat(c).take(32).collect();
        format!("{digest}-{name}").parse().unwrap()
    }

    fn info(p: &StorePath, refs: &[&StorePath]) -> PathInfo {
        let mut info = PathInfo::new(p.clone(), [0u8; 32], 100);
        info.references = refs.iter().map(|r| (*r).clone()).collect();
        info
    }

    #[test]
    fn register_and_query() {
        let db = Db::open_in_memory().unwrap();
        let a = path('a', "a");
        let b = path('b', "b");

        db.register_valid_paths(&[info(&a, &[])]).unwrap();
        db.register_valid_paths(&[info(&b, &[&a, &b])]).unwrap();

        assert!(db.is_valid(&a).unwrap());
        assert!(!db.is_valid(&path('c', "c")).unwrap());

        let got = db.query_path_info(&b).unwrap().unwrap();
        assert_eq!(
            got.references,
            BTreeSet::from([a.clone(), b.clone()])
        );
        assert!(got.registration_time > 0);

        assert_eq!(db.query_referrers(&a).unwrap(), BTreeSet::from([b.clone()]));
        // self-reference shows up as a referrer of itself
        assert!(db.query_referrers(&b).unwrap().contains(&b));
    }

    #[test]
    fn dangling_reference_rolls_back() {
        let db = Db::open_in_memory().unwrap();
        let a = path('a', "a");
        let ghost = path('f', "ghost");

        db.register_valid_paths(&[info(&a, &[&ghost])]).unwrap_err();
        // invariant 5: after a failed registration, nothing is observable
        assert!(!db.is_valid(&a).unwrap());
    }

    #[test]
    fn batch_references_resolve_within_batch() {
        let db = Db::open_in_memory().unwrap();
        let a = path('a', "a");
        let b = path('b', "b");
        db.register_valid_paths(&[info(&a, &[&b]), info(&b, &[])]).unwrap();
        assert!(db.is_valid(&a).unwrap());
        assert!(db.is_valid(&b).unwrap());
    }

    #[test]
    fn invalidate_respects_referrers() {
        let db = Db::open_in_memory().unwrap();
        let a = path('a', "a");
        let b = path('b', "b");
        db.register_valid_paths(&[info(&a, &[]), info(&b, &[&a])]).unwrap();

        // a is still referenced by b
        db.invalidate(&[a.clone()]).unwrap_err();
        assert!(db.is_valid(&a).unwrap());

        // deleting both in one transaction is fine
        db.invalidate(&[b.clone(), a.clone()]).unwrap();
        assert!(!db.is_valid(&a).unwrap());
        assert!(!db.is_valid(&b).unwrap());
    }

    #[test]
    fn successors() {
        let db = Db::open_in_memory().unwrap();
        let drv = path('d', "x.drv");
        let nf = path('1', "x.closure");

        assert!(db.query_successor(&drv).unwrap().is_none());
        db.register_successor(&drv, &nf).unwrap();
        assert_eq!(db.query_successor(&drv).unwrap(), Some(nf.clone()));

        // re-registration silently replaces
        db.register_successor(&drv, &nf).unwrap();
        db.unregister_successor(&drv).unwrap();
        assert!(db.query_successor(&drv).unwrap().is_none());
    }

    #[test]
    fn derivation_outputs() {
        let db = Db::open_in_memory().unwrap();
        let drv = path('d', "x.drv");
        let out = path('1', "x");
        db.register_valid_paths(&[info(&drv, &[])]).unwrap();
        db.register_derivation_output(&drv, "out", &out).unwrap();
        assert_eq!(db.query_derivation_outputs(&drv).unwrap(), vec![out]);
    }

    #[test]
    fn substitutes_ordered_by_priority() {
        let db = Db::open_in_memory().unwrap();
        let p = path('1', "wanted");
        let sub = |prio, prog: &str| Substitute {
            store_expr: path('e', "subst.closure"),
            program: prog.to_string(),
            args: vec!["--fetch".into()],
            priority: prio,
        };

        db.register_substitute(&p, &sub(10, "slow")).unwrap();
        db.register_substitute(&p, &sub(1, "fast")).unwrap();

        let subs = db.query_substitutes(&p).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].program, "fast");
        assert_eq!(subs[1].program, "slow");
    }

    #[test]
    fn realisations() {
        let db = Db::open_in_memory().unwrap();
        let r = super::Realisation {
            drv_path: path('d', "x.drv"),
            output_name: "out".into(),
            output_path: path('1', "x"),
            signatures: vec![],
        };
        db.register_realisation(&r).unwrap();
        assert_eq!(db.query_realisation(&r.drv_path, "out").unwrap(), Some(r));
    }
}
