//! Reachability over the reference DAG.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Condvar, Mutex};

use nixwire::store_path::StorePath;

use crate::db::Db;
use crate::error::{Error, Result};

struct State {
    queue: VecDeque<StorePath>,
    visited: BTreeSet<StorePath>,
    in_flight: usize,
    error: Option<Error>,
}

/// Compute the closure of `roots` over `references`, fetching each
/// node's edges from the database on a bounded worker pool. The DAG is
/// acyclic by construction (a path's digest exists before any
/// referrer), but the visited set also makes revisits cheap.
pub fn compute_fs_closure(
    db: &Db,
    roots: impl IntoIterator<Item = StorePath>,
    workers: usize,
) -> Result<BTreeSet<StorePath>> {
    let roots: BTreeSet<StorePath> = roots.into_iter().collect();
    let state = Mutex::new(State {
        queue: roots.iter().cloned().collect(),
        visited: roots,
        in_flight: 0,
        error: None,
    });
    let wakeup = Condvar::new();

    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| loop {
                let path = {
                    let mut state = state.lock().expect("closure state poisoned");
                    loop {
                        if state.error.is_some() {
                            return;
                        }
                        if let Some(path) = state.queue.pop_front() {
                            state.in_flight += 1;
                            break path;
                        }
                        if state.in_flight == 0 {
                            // queue drained and nobody can refill it
                            wakeup.notify_all();
                            return;
                        }
                        state = wakeup.wait(state).expect("closure state poisoned");
                    }
                };

                let references = db
                    .query_path_info(&path)
                    .and_then(|info| info.ok_or(Error::InvalidPath(path.clone())))
                    .map(|info| info.references);

                let mut state = state.lock().expect("closure state poisoned");
                state.in_flight -= 1;
                match references {
                    Ok(references) => {
                        for reference in references {
                            if state.visited.insert(reference.clone()) {
                                state.queue.push_back(reference);
                            }
                        }
                    }
                    Err(e) => {
                        state.error.get_or_insert(e);
                    }
                }
                wakeup.notify_all();
            });
        }
    });

    let state = state.into_inner().expect("closure state poisoned");
    match state.error {
        Some(e) => Err(e),
        None => Ok(state.visited),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use nixwire::path_info::PathInfo;
    use nixwire::store_path::StorePath;

    use crate::db::Db;

    use super::compute_fs_closure;

    fn path(c: char) -> StorePath {
        let digest: String = std::iter::repeat(c).take(32).collect();
        format!("{digest}-n").parse().unwrap()
    }

    fn register(db: &Db, p: &StorePath, refs: &[&StorePath]) {
        let mut info = PathInfo::new(p.clone(), [0; 32], 1);
        info.references = refs.iter().map(|r| (*r).clone()).collect();
        db.register_valid_paths(&[info]).unwrap();
    }

    #[test]
    fn matches_bfs_reachability() {
        let db = Db::open_in_memory().unwrap();
        let (a, b, c, d, e) = (path('a'), path('b'), path('c'), path('d'), path('1'));

        register(&db, &d, &[]);
        register(&db, &c, &[&d]);
        register(&db, &b, &[&c, &d]);
        register(&db, &a, &[&b]);
        register(&db, &e, &[]); // unreachable

        let closure = compute_fs_closure(&db, [a.clone()], 4).unwrap();
        assert_eq!(
            closure,
            BTreeSet::from([a.clone(), b, c, d])
        );
    }

    #[test]
    fn self_references_terminate() {
        let db = Db::open_in_memory().unwrap();
        let a = path('a');
        register(&db, &a, &[&a]);
        let closure = compute_fs_closure(&db, [a.clone()], 2).unwrap();
        assert_eq!(closure, BTreeSet::from([a]));
    }

    #[test]
    fn multiple_roots_union() {
        let db = Db::open_in_memory().unwrap();
        let (a, b, c) = (path('a'), path('b'), path('c'));
        register(&db, &a, &[]);
        register(&db, &b, &[]);
        register(&db, &c, &[&a]);

        let closure = compute_fs_closure(&db, [b.clone(), c.clone()], 2).unwrap();
        assert_eq!(closure, BTreeSet::from([a, b, c]));
    }

    #[test]
    fn missing_reference_is_an_error() {
        let db = Db::open_in_memory().unwrap();
        compute_fs_closure(&db, [path('a')], 2).unwrap_err();
    }
}
