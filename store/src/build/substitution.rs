//! The substitution goal: materialize one store path by running
//! registered substituter programs, best priority first. Each
//! substituter is itself an artifact, so its own store expression is
//! normalized and realized before it can run.

use std::collections::VecDeque;

use tokio::process::Command;
use tracing::{debug, info, warn};

use nixwire::path_info::PathInfo;
use nixwire::store_path::{StorePath, ENCODED_DIGEST_LEN};

use crate::db::Substitute;
use crate::error::Result;
use crate::local::{delete_path, make_read_only};

use super::lock::PathLocks;
use super::worker::{Goal, GoalCore, GoalId, GoalKind, StepResult, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Init,
    TryNext,
    ExprNormalized,
    ExprRealized,
    TryToRun,
    Finished,
}

pub struct SubstitutionGoal {
    pub store_path: StorePath,
    state: State,
    substitutes: VecDeque<Substitute>,
    current: Option<Substitute>,
    nf_sub: Option<StorePath>,
    output_lock: Option<PathLocks>,
}

impl SubstitutionGoal {
    pub fn new(store_path: StorePath) -> Self {
        SubstitutionGoal {
            store_path,
            state: State::Init,
            substitutes: VecDeque::new(),
            current: None,
            nf_sub: None,
            output_lock: None,
        }
    }

    pub(crate) async fn work(goal: &mut Goal, id: GoalId, worker: &mut Worker) -> Result<StepResult> {
        let Goal { core, kind } = goal;
        let GoalKind::Substitution(this) = kind else {
            unreachable!("goal kind mismatch");
        };

        match this.state {
            State::Init => this.init(worker),
            State::TryNext => this.try_next(core, id, worker),
            State::ExprNormalized => this.expr_normalized(core, id, worker),
            State::ExprRealized => this.expr_realized(core),
            State::TryToRun => this.try_to_run(id, worker),
            State::Finished => this.finished(core, worker),
        }
    }

    fn init(&mut self, worker: &mut Worker) -> Result<StepResult> {
        if worker.store.db.is_valid(&self.store_path)? {
            return Ok(StepResult::Done(true));
        }
        self.substitutes = worker
            .store
            .db
            .query_substitutes(&self.store_path)?
            .into();
        self.state = State::TryNext;
        Ok(StepResult::Continue)
    }

    fn try_next(
        &mut self,
        core: &mut GoalCore,
        id: GoalId,
        worker: &mut Worker,
    ) -> Result<StepResult> {
        let Some(substitute) = self.substitutes.pop_front() else {
            warn!(
                path = %self.store_path,
                "path is required, but it has no (remaining) substitutes"
            );
            return Ok(StepResult::Done(false));
        };

        core.nr_failed = 0;
        let normalization = worker.make_normalization_goal(substitute.store_expr.clone());
        worker.add_waitee(core, id, normalization);
        self.current = Some(substitute);
        self.state = State::ExprNormalized;
        Ok(StepResult::Waiting)
    }

    fn expr_normalized(
        &mut self,
        core: &mut GoalCore,
        id: GoalId,
        worker: &mut Worker,
    ) -> Result<StepResult> {
        if core.nr_failed > 0 {
            self.state = State::TryNext;
            return Ok(StepResult::Continue);
        }

        let substitute = self.current.as_ref().expect("substitute chosen");
        self.nf_sub = Some(super::query_normal_form(
            &worker.store,
            &substitute.store_expr,
        )?);
        let realization = worker.make_realization_goal(substitute.store_expr.clone());
        worker.add_waitee(core, id, realization);
        self.state = State::ExprRealized;
        Ok(StepResult::Waiting)
    }

    fn expr_realized(&mut self, core: &mut GoalCore) -> Result<StepResult> {
        if core.nr_failed > 0 {
            self.state = State::TryNext;
            return Ok(StepResult::Continue);
        }
        self.state = State::TryToRun;
        Ok(StepResult::WaitForSlot { substitution: true })
    }

    fn try_to_run(&mut self, id: GoalId, worker: &mut Worker) -> Result<StepResult> {
        if !worker.can_build_more() || !worker.can_substitute_more() {
            return Ok(StepResult::WaitForSlot { substitution: true });
        }

        let real = worker.store.real_path(&self.store_path);
        let mut lock = PathLocks::new();
        let interrupted = worker.interrupted.clone();
        tokio::task::block_in_place(|| {
            lock.lock([real.as_path()], move || {
                interrupted.load(std::sync::atomic::Ordering::Relaxed)
            })
        })?;

        // someone else may have produced the path while we blocked
        if worker.store.db.is_valid(&self.store_path)? {
            debug!(path = %self.store_path, "path has become valid");
            lock.set_deletion(true);
            return Ok(StepResult::Done(true));
        }
        self.output_lock = Some(lock);

        let substitute = self.current.as_ref().expect("substitute chosen");
        let nf_sub = self.nf_sub.as_ref().expect("substituter normal form");

        // the program lives inside the substituter's own closure,
        // unless given as an absolute path
        let program = if substitute.program.starts_with('/') {
            std::path::PathBuf::from(&substitute.program)
        } else {
            let closure = worker.store.read_store_expr(nf_sub)?;
            let root = closure
                .as_closure(nf_sub)?
                .roots
                .iter()
                .next()
                .cloned()
                .ok_or_else(|| crate::Error::SubstError {
                    path: self.store_path.clone(),
                    reason: format!("substituter {nf_sub} has an empty closure"),
                })?;
            worker.store.real_path(&root).join(&substitute.program)
        };

        // remove stale leftovers of earlier attempts
        if real.symlink_metadata().is_ok() {
            delete_path(&real)?;
        }

        info!(
            path = %self.store_path,
            substituter = %program.display(),
            "substituting"
        );

        let mut command = Command::new(&program);
        command
            .args(&substitute.args)
            .arg(worker.store.settings.store_dir.display_path(&self.store_path))
            .env_clear()
            .env("NIX_STORE", worker.store.settings.store_dir.as_str());

        let log_path = worker.log_path_for(&self.store_path);
        worker.child_started(id, command, log_path, true, true)?;
        worker.stats.substitutions_started += 1;
        self.state = State::Finished;
        Ok(StepResult::WaitForChild)
    }

    fn finished(&mut self, core: &mut GoalCore, worker: &mut Worker) -> Result<StepResult> {
        let status = core.child_status.take().expect("substituter status missing");
        let real = worker.store.real_path(&self.store_path);

        let failure = if !status.success() {
            Some(format!("substituter {status}"))
        } else if real.symlink_metadata().is_err() {
            Some("substituter did not produce the path".to_string())
        } else {
            None
        };

        if let Some(reason) = failure {
            let substitute = self.current.as_ref().expect("substitute chosen");
            warn!(
                path = %self.store_path,
                substituter = %substitute.store_expr,
                reason,
                "substitution attempt failed"
            );
            worker.stats.substitutions_failed += 1;
            // keep the lock file; the next attempt re-acquires it
            self.output_lock = None;
            self.state = State::TryNext;
            return Ok(StepResult::Continue);
        }

        // canonicalize, hash and scan the result, then register it
        make_read_only(&real)?;
        let mut candidates = std::collections::BTreeMap::new();
        for path in worker.store.db.query_valid_paths()? {
            candidates.insert(digest_key(&path), path);
        }
        candidates.insert(digest_key(&self.store_path), self.store_path.clone());

        let (references, nar_hash, nar_size) =
            worker.store.scan_for_references(&real, &candidates)?;
        let mut info = PathInfo::new(self.store_path.clone(), nar_hash, nar_size);
        info.references = references;
        worker.store.db.register_valid_paths(&[info])?;

        if let Some(lock) = &mut self.output_lock {
            lock.set_deletion(true);
        }
        self.output_lock = None;

        worker.stats.substitutions_succeeded += 1;
        debug!(path = %self.store_path, "substitution succeeded");
        Ok(StepResult::Done(true))
    }
}

fn digest_key(path: &StorePath) -> [u8; ENCODED_DIGEST_LEN] {
    path.digest_str()
        .into_bytes()
        .try_into()
        .expect("digest part has fixed length")
}
