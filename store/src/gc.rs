//! Garbage collection: root discovery, liveness, deletion.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use nixwire::store_path::StorePath;

use crate::closure::compute_fs_closure;
use crate::error::Result;
use crate::local::{delete_path, LocalStore};

#[derive(Debug, Default)]
pub struct GcOptions {
    /// Stop once this many bytes have been freed.
    pub max_freed: Option<u64>,
    /// Delete regardless of liveness. Debugging only.
    pub ignore_liveness: bool,
    /// Report what would be deleted without touching anything.
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct GcResults {
    pub deleted: Vec<StorePath>,
    pub bytes_freed: u64,
}

/// Persistent roots: symlinks under the roots directory that point
/// into the store.
pub fn find_persistent_roots(store: &LocalStore) -> Result<BTreeSet<StorePath>> {
    let mut roots = BTreeSet::new();
    let dir = store.settings.gc_roots_dir();
    for entry in walkdir::WalkDir::new(&dir).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable root entry");
                continue;
            }
        };
        if !entry.path_is_symlink() {
            continue;
        }
        let target = std::fs::read_link(entry.path())?;
        match store
            .settings
            .store_dir
            .parse_path(&target.to_string_lossy())
        {
            Ok(path) => {
                debug!(root = %entry.path().display(), path = %path, "found root");
                roots.insert(path);
            }
            Err(_) => {
                warn!(root = %entry.path().display(), "root does not point into the store");
            }
        }
    }
    Ok(roots)
}

/// Transient roots: paths recorded by running clients. Files owned by
/// dead processes are cleaned up on the way.
pub fn find_temp_roots(store: &LocalStore) -> Result<BTreeSet<StorePath>> {
    let mut roots = BTreeSet::new();
    let dir = store.settings.temp_roots_dir();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(pid) = name.to_string_lossy().parse::<i32>().ok() else {
            continue;
        };

        if !process_alive(pid) {
            debug!(pid, "removing stale temp-roots file");
            let _ = std::fs::remove_file(entry.path());
            continue;
        }

        let contents = std::fs::read_to_string(entry.path())?;
        for line in contents.lines() {
            if let Ok(path) = store.settings.store_dir.parse_path(line.trim()) {
                roots.insert(path);
            }
        }
    }
    Ok(roots)
}

fn process_alive(pid: i32) -> bool {
    // signal 0: existence check only
    unsafe { libc::kill(pid, 0) == 0 }
}

/// The live set: closure of all roots, extended per `keep-outputs` /
/// `keep-derivations` until a fixed point.
#[instrument(skip(store))]
pub fn find_live_paths(store: &LocalStore) -> Result<BTreeSet<StorePath>> {
    let mut roots = find_persistent_roots(store)?;
    roots.extend(find_temp_roots(store)?);

    // successors of live derivations are live as well: the normal form
    // is what the roots actually mean
    let mut pending: Vec<StorePath> = roots.iter().cloned().collect();
    while let Some(p) = pending.pop() {
        if let Some(successor) = store.db.query_successor(&p)? {
            if roots.insert(successor.clone()) {
                pending.push(successor);
            }
        }
    }

    // roots may dangle (a rooted path deleted by hand); ignore those
    let mut valid_roots = BTreeSet::new();
    for path in roots {
        if store.db.is_valid(&path)? {
            valid_roots.insert(path);
        }
    }

    let workers = store.settings.closure_workers;
    let mut live = compute_fs_closure(&store.db, valid_roots, workers)?;

    loop {
        let mut grew = false;

        if store.settings.keep_outputs {
            let mut extra = BTreeSet::new();
            for path in &live {
                for output in store.db.query_derivation_outputs(path)? {
                    if !live.contains(&output) && store.db.is_valid(&output)? {
                        extra.insert(output);
                    }
                }
            }
            if !extra.is_empty() {
                live.extend(compute_fs_closure(&store.db, extra, workers)?);
                grew = true;
            }
        }

        if store.settings.keep_derivations {
            let mut extra = BTreeSet::new();
            for path in &live {
                if let Some(info) = store.db.query_path_info(path)? {
                    if let Some(deriver) = info.deriver {
                        if !live.contains(&deriver) && store.db.is_valid(&deriver)? {
                            extra.insert(deriver);
                        }
                    }
                }
            }
            if !extra.is_empty() {
                live.extend(compute_fs_closure(&store.db, extra, workers)?);
                grew = true;
            }
        }

        if !grew {
            return Ok(live);
        }
    }
}

/// Delete everything in the store directory that is not live.
#[instrument(skip(store), fields(store_dir = %store.settings.store_dir))]
pub fn collect_garbage(store: &LocalStore, options: &GcOptions) -> Result<GcResults> {
    let live = if options.ignore_liveness {
        BTreeSet::new()
    } else {
        find_live_paths(store)?
    };

    // lexical scan of the store directory; anything unparseable or
    // unregistered is garbage from an interrupted operation
    let mut names: Vec<String> = vec![];
    for entry in std::fs::read_dir(Path::new(store.settings.store_dir.as_str()))? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    let mut dead: Vec<StorePath> = vec![];
    let mut cruft: Vec<String> = vec![];
    for name in names {
        match StorePath::from_basename(&name) {
            Ok(path) if live.contains(&path) => {}
            Ok(path) => dead.push(path),
            Err(_) => cruft.push(name),
        }
    }

    // delete referrers before their references, so per-path
    // invalidation never breaks invariant 3
    let dead = topo_sort_referrers_first(store, dead)?;

    let mut results = GcResults::default();
    if options.dry_run {
        results.deleted = dead;
        return Ok(results);
    }

    for name in cruft {
        let real = Path::new(store.settings.store_dir.as_str()).join(&name);
        debug!(path = %real.display(), "deleting unregistered file");
        results.bytes_freed += delete_path(&real)?;
    }

    for path in dead {
        if let Some(max) = options.max_freed {
            if results.bytes_freed >= max {
                info!(freed = results.bytes_freed, "reached max-freed, stopping");
                break;
            }
        }
        if store.db.is_valid(&path)? {
            store.db.invalidate(std::slice::from_ref(&path))?;
        }
        let real = store.real_path(&path);
        if real.exists() || real.symlink_metadata().is_ok() {
            results.bytes_freed += delete_path(&real)?;
        }
        debug!(path = %path, "deleted");
        results.deleted.push(path);
    }

    info!(
        deleted = results.deleted.len(),
        bytes = results.bytes_freed,
        "garbage collection finished"
    );
    Ok(results)
}

/// Order `dead` so that every path precedes the paths it references
/// (within the dead set).
fn topo_sort_referrers_first(store: &LocalStore, dead: Vec<StorePath>) -> Result<Vec<StorePath>> {
    let dead_set: BTreeSet<StorePath> = dead.iter().cloned().collect();

    // count, for each dead path, its dead referrers
    let mut blockers: BTreeMap<StorePath, usize> = BTreeMap::new();
    let mut edges: BTreeMap<StorePath, Vec<StorePath>> = BTreeMap::new();
    for path in &dead {
        blockers.entry(path.clone()).or_insert(0);
        if !store.db.is_valid(path)? {
            continue;
        }
        if let Some(info) = store.db.query_path_info(path)? {
            for reference in info.references {
                if reference != *path && dead_set.contains(&reference) {
                    *blockers.entry(reference.clone()).or_insert(0) += 1;
                    edges.entry(path.clone()).or_default().push(reference);
                }
            }
        }
    }

    let mut ready: Vec<StorePath> = blockers
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(p, _)| p.clone())
        .collect();
    let mut ordered = vec![];
    while let Some(path) = ready.pop() {
        if let Some(references) = edges.get(&path) {
            for reference in references.clone() {
                let n = blockers.get_mut(&reference).expect("edge into dead set");
                *n -= 1;
                if *n == 0 {
                    ready.push(reference);
                }
            }
        }
        ordered.push(path);
    }

    // cycles are impossible; anything left over is a bookkeeping bug
    debug_assert_eq!(ordered.len(), dead.len());
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::os::unix::fs::symlink;

    use nixwire::path_info::PathInfo;
    use nixwire::store_path::StorePath;

    use crate::local::LocalStore;
    use crate::settings::Settings;

    use super::{collect_garbage, find_live_paths, GcOptions};

    fn test_store(configure: impl FnOnce(&mut Settings)) -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::with_root(dir.path());
        configure(&mut settings);
        let store = LocalStore::open(settings).unwrap();
        (dir, store)
    }

    /// Register a fake artifact with the given references; contents
    /// don't matter for liveness.
    fn add(store: &LocalStore, name: &str, refs: &[&StorePath], deriver: Option<&StorePath>) -> StorePath {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), name).unwrap();

        // compute the path first, then fix up metadata directly
        let path = store.add_path_to_store(name, src.path()).unwrap();
        let mut info = store.query_path_info(&path).unwrap().unwrap();
        info.references = refs.iter().map(|r| (*r).clone()).collect();
        info.deriver = deriver.cloned();
        store.db.register_valid_paths(&[info]).unwrap();
        path
    }

    fn add_root(store: &LocalStore, path: &StorePath) {
        let link = store.settings.gc_roots_dir().join(path.name());
        symlink(store.real_path(path), link).unwrap();
    }

    #[test]
    fn unreferenced_paths_are_deleted() {
        let (_dir, store) = test_store(|_| {});
        let keep = add(&store, "keep", &[], None);
        let drop = add(&store, "drop", &[], None);
        add_root(&store, &keep);

        let results = collect_garbage(&store, &GcOptions::default()).unwrap();
        assert_eq!(results.deleted, vec![drop.clone()]);
        assert!(results.bytes_freed > 0);

        assert!(store.is_valid(&keep).unwrap());
        assert!(!store.is_valid(&drop).unwrap());
        assert!(!store.real_path(&drop).exists());
    }

    #[test]
    fn closure_of_roots_survives() {
        let (_dir, store) = test_store(|_| {});
        let dep = add(&store, "dep", &[], None);
        let root = add(&store, "root", &[&dep], None);
        add_root(&store, &root);

        collect_garbage(&store, &GcOptions::default()).unwrap();
        assert!(store.is_valid(&dep).unwrap());
        assert!(store.is_valid(&root).unwrap());
    }

    #[test]
    fn temp_roots_protect() {
        let (_dir, store) = test_store(|_| {});
        let path = add(&store, "transient", &[], None);
        store.add_temp_root(&path).unwrap();

        collect_garbage(&store, &GcOptions::default()).unwrap();
        assert!(store.is_valid(&path).unwrap());
    }

    #[test]
    fn keep_outputs_retains_outputs_but_not_build_inputs() {
        // D is rooted; out1 is D's output; C was only consumed while
        // building and has no incoming reference edge
        let (_dir, store) = test_store(|s| {
            s.keep_outputs = true;
            s.keep_derivations = false;
        });

        let c = add(&store, "build-input", &[], None);
        let drv = add(&store, "thing.drv", &[], None);
        let out = add(&store, "thing-out", &[], Some(&drv));
        store.db.register_derivation_output(&drv, "out", &out).unwrap();
        add_root(&store, &drv);

        let results = collect_garbage(&store, &GcOptions::default()).unwrap();

        assert!(store.is_valid(&drv).unwrap());
        assert!(store.is_valid(&out).unwrap());
        assert!(!store.is_valid(&c).unwrap());
        assert!(results.deleted.contains(&c));
    }

    #[test]
    fn keep_derivations_retains_deriver() {
        let (_dir, store) = test_store(|s| {
            s.keep_derivations = true;
        });
        let drv = add(&store, "x.drv", &[], None);
        let out = add(&store, "x-out", &[], Some(&drv));
        add_root(&store, &out);

        collect_garbage(&store, &GcOptions::default()).unwrap();
        assert!(store.is_valid(&drv).unwrap());
    }

    #[test]
    fn deriver_deleted_without_keep_derivations() {
        let (_dir, store) = test_store(|s| {
            s.keep_derivations = false;
        });
        let drv = add(&store, "x.drv", &[], None);
        let out = add(&store, "x-out", &[], Some(&drv));
        add_root(&store, &out);

        collect_garbage(&store, &GcOptions::default()).unwrap();
        assert!(!store.is_valid(&drv).unwrap());
        assert!(store.is_valid(&out).unwrap());
    }

    #[test]
    fn max_freed_stops_early() {
        let (_dir, store) = test_store(|_| {});
        for i in 0..5 {
            add(&store, &format!("garbage-{i}"), &[], None);
        }

        let results = collect_garbage(
            &store,
            &GcOptions {
                max_freed: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        // stops after the first deletion crosses the threshold
        assert!(results.deleted.len() < 5);
    }

    #[test]
    fn chains_are_deleted_in_referrer_order() {
        let (_dir, store) = test_store(|_| {});
        let base = add(&store, "base", &[], None);
        let mid = add(&store, "mid", &[&base], None);
        let _top = add(&store, "top", &[&mid], None);

        let results = collect_garbage(&store, &GcOptions::default()).unwrap();
        assert_eq!(results.deleted.len(), 3);
        let live = find_live_paths(&store).unwrap();
        assert_eq!(live, BTreeSet::new());
    }
}
