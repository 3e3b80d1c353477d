//! The realization engine: cooperative goals scheduled by a single
//! worker.
//!
//! Three goal kinds exist. A *normalization* goal actually builds a
//! derivation and registers its closure normal form as the successor.
//! A *realization* goal brings a derivation's output closure into
//! existence, preferring substitution and falling back to a build. A
//! *substitution* goal materializes one store path by running
//! registered substituter programs.
//!
//! Goals advance one explicit state per [work](worker::Worker) step
//! and never block; waiting happens only in the worker's event loop,
//! on child process I/O.

pub mod lock;
mod normalization;
mod realization;
mod substitution;
mod worker;

pub use normalization::NormalizationGoal;
pub use realization::RealizationGoal;
pub use substitution::SubstitutionGoal;
pub use worker::{Goal, GoalCore, GoalId, GoalKind, StepResult, Worker, WorkerStats};

use std::sync::Arc;

use nixwire::store_path::StorePath;

use crate::error::{Error, Result};
use crate::local::LocalStore;

/// Build a derivation (unless a successor exists) and return its
/// normal form.
pub async fn normalise(store: Arc<LocalStore>, drv: &StorePath) -> Result<StorePath> {
    let mut worker = Worker::new(store.clone());
    let goal = worker.make_normalization_goal(drv.clone());
    if !worker.run(vec![goal]).await? {
        return Err(Error::BuildError {
            drv: drv.clone(),
            status: "normalization failed".to_string(),
            log_path: Some(store.settings.log_dir.join(drv.to_string())),
        });
    }
    query_normal_form(&store, drv)
}

/// Ensure the output closure of a derivation exists, substituting
/// where possible.
pub async fn realise(store: Arc<LocalStore>, drv: &StorePath) -> Result<StorePath> {
    let mut worker = Worker::new(store.clone());
    let goal = worker.make_realization_goal(drv.clone());
    if !worker.run(vec![goal]).await? {
        return Err(Error::BuildError {
            drv: drv.clone(),
            status: "realization failed".to_string(),
            log_path: Some(store.settings.log_dir.join(drv.to_string())),
        });
    }
    query_normal_form(&store, drv)
}

/// Make one store path valid, through substitutes.
pub async fn ensure_path(store: Arc<LocalStore>, path: &StorePath) -> Result<()> {
    if store.is_valid(path)? {
        return Ok(());
    }
    let mut worker = Worker::new(store);
    let goal = worker.make_substitution_goal(path.clone());
    if !worker.run(vec![goal]).await? {
        return Err(Error::SubstError {
            path: path.clone(),
            reason: "no (remaining) substitute could produce the path".to_string(),
        });
    }
    Ok(())
}

/// The normal form of a derivation path: its registered successor, or
/// the path itself if it already holds a closure expression.
pub fn query_normal_form(store: &LocalStore, drv: &StorePath) -> Result<StorePath> {
    if let Some(successor) = store.db.query_successor(drv)? {
        return Ok(successor);
    }
    let expr = store.read_store_expr(drv)?;
    if expr.is_closure() {
        Ok(drv.clone())
    } else {
        Err(Error::InvalidPath(drv.clone()))
    }
}
