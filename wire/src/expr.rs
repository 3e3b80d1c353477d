//! Store expressions: build recipes and their closure normal forms.
//!
//! A derivation describes how to produce outputs; a closure describes
//! a set of existing paths together with their reference edges. The
//! realization engine rewrites derivations into closures ("normal
//! forms") and records the mapping as a successor edge.
//!
//! Expressions are stored in the store themselves, as canonical JSON
//! (sorted maps, no insignificant whitespace), so their store paths
//! are deterministic.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{hash_bytes, Algo};
use crate::store_path::{self, StoreDir, StorePath};

/// A build recipe. The scheduler treats `builder` as an opaque
/// executable; see the builder contract in the engine crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    /// Output paths the builder must produce.
    pub outputs: BTreeSet<StorePath>,
    /// Store paths of input expressions (derivations or closures).
    pub inputs: BTreeSet<StorePath>,
    /// Platform tag; a builder only runs on a matching host.
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// The normal form of a derivation: its output paths plus every path
/// they transitively need, with the reference edges between them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub roots: BTreeSet<StorePath>,
    /// Path to its references; domain is the full closure.
    pub elems: BTreeMap<StorePath, BTreeSet<StorePath>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreExpr {
    Derivation(Derivation),
    Closure(Closure),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed store expression: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("store expression at {0} is not a {1}")]
    WrongKind(StorePath, &'static str),
    #[error(transparent)]
    StorePath(#[from] store_path::Error),
}

impl StoreExpr {
    pub fn to_json(&self) -> String {
        // BTree maps keep the rendering canonical
        serde_json::to_string(self).expect("store expressions always serialize")
    }

    pub fn from_json(s: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(s)?)
    }

    /// The store path this expression serializes to. Text-hashed over
    /// the canonical JSON, so equal expressions land on equal paths.
    pub fn compute_path(&self, store_dir: &StoreDir, name: &str) -> Result<StorePath, Error> {
        let content_hash = hash_bytes(Algo::Sha256, self.to_json().as_bytes());
        Ok(store_dir.make_text_path(name, &content_hash, [])?)
    }

    pub fn as_derivation(&self, at: &StorePath) -> Result<&Derivation, Error> {
        match self {
            StoreExpr::Derivation(d) => Ok(d),
            _ => Err(Error::WrongKind(at.clone(), "derivation")),
        }
    }

    pub fn as_closure(&self, at: &StorePath) -> Result<&Closure, Error> {
        match self {
            StoreExpr::Closure(c) => Ok(c),
            _ => Err(Error::WrongKind(at.clone(), "closure")),
        }
    }

    pub fn is_closure(&self) -> bool {
        matches!(self, StoreExpr::Closure(_))
    }
}

impl Closure {
    /// Restrict a closure to what is reachable from `roots`, following
    /// reference edges within `self`.
    pub fn restrict(&self, roots: impl IntoIterator<Item = StorePath>) -> Closure {
        let mut out = Closure::default();
        let mut queue: Vec<StorePath> = roots.into_iter().collect();
        out.roots = queue.iter().cloned().collect();

        while let Some(path) = queue.pop() {
            if out.elems.contains_key(&path) {
                continue;
            }
            if let Some(refs) = self.elems.get(&path) {
                out.elems.insert(path, refs.clone());
                queue.extend(refs.iter().cloned());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{Closure, Derivation, StoreExpr};
    use crate::store_path::{StoreDir, StorePath};

    fn path(c: char, name: &str) -> StorePath {
        let digest_str: String = std::iter::repeat(c).take(32).collect();
        format!("{digest_str}-{name}").parse().unwrap()
    }

    fn sample_derivation() -> Derivation {
        Derivation {
            outputs: [path('1', "out")].into(),
            inputs: [path('2', "dep.drv")].into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            args: vec!["-c".into(), "true".into()],
            env: BTreeMap::from([("out".to_string(), "/nix/store/...".to_string())]),
        }
    }

    #[test]
    fn json_roundtrip() {
        let expr = StoreExpr::Derivation(sample_derivation());
        let json = expr.to_json();
        assert_eq!(StoreExpr::from_json(json.as_bytes()).unwrap(), expr);
        assert!(json.starts_with("{\"type\":\"derivation\""));
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = StoreExpr::Derivation(sample_derivation()).to_json();
        let b = StoreExpr::Derivation(sample_derivation()).to_json();
        assert_eq!(a, b);

        let store_dir = StoreDir::default();
        assert_eq!(
            StoreExpr::Derivation(sample_derivation())
                .compute_path(&store_dir, "sample.drv")
                .unwrap(),
            StoreExpr::Derivation(sample_derivation())
                .compute_path(&store_dir, "sample.drv")
                .unwrap()
        );
    }

    #[test]
    fn kind_accessors() {
        let at = path('3', "x");
        let expr = StoreExpr::Closure(Closure::default());
        expr.as_closure(&at).unwrap();
        expr.as_derivation(&at).unwrap_err();
    }

    #[test]
    fn restrict_follows_edges() {
        let a = path('a', "a");
        let b = path('b', "b");
        let c = path('c', "c");
        let d = path('d', "d");

        let closure = Closure {
            roots: [a.clone(), d.clone()].into(),
            elems: BTreeMap::from([
                (a.clone(), BTreeSet::from([b.clone()])),
                (b.clone(), BTreeSet::new()),
                (c.clone(), BTreeSet::new()),
                (d.clone(), BTreeSet::new()),
            ]),
        };

        let restricted = closure.restrict([a.clone()]);
        assert!(restricted.elems.contains_key(&a));
        assert!(restricted.elems.contains_key(&b));
        assert!(!restricted.elems.contains_key(&c));
        assert!(!restricted.elems.contains_key(&d));
    }
}
