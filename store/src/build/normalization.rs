//! The normalization goal: turn a derivation into its closure normal
//! form by running the builder (or the build hook), then register the
//! outputs and the successor mapping.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tokio::process::Command;
use tracing::{debug, info, warn};

use nixwire::expr::{Closure, Derivation, StoreExpr};
use nixwire::path_info::PathInfo;
use nixwire::store_path::{StorePath, ENCODED_DIGEST_LEN};

use crate::error::{Error, Result};
use crate::local::{delete_path, make_read_only};

use super::lock::PathLocks;
use super::worker::{Goal, GoalCore, GoalId, GoalKind, StepResult, Worker};

/// Hook protocol: the hook either performs the whole remote build and
/// exits 0, or bows out with one of these codes.
const HOOK_DECLINE: i32 = 100;
const HOOK_POSTPONE: i32 = 101;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Init,
    HaveExpr,
    InputsNormalized,
    InputsRealized,
    TryToBuild,
    HookDone,
    BuildDone,
}

pub struct NormalizationGoal {
    pub drv_path: StorePath,
    state: State,
    derivation: Option<Derivation>,
    output_locks: Option<PathLocks>,
    /// Closure elements of every input's normal form.
    in_closures: BTreeMap<StorePath, BTreeSet<StorePath>>,
    /// Everything the outputs may legitimately reference: the input
    /// closures plus the outputs themselves.
    all_paths: BTreeSet<StorePath>,
    input_successors: BTreeMap<StorePath, StorePath>,
    build_tmp: Option<tempfile::TempDir>,
    hook_declined: bool,
}

impl NormalizationGoal {
    pub fn new(drv_path: StorePath) -> Self {
        NormalizationGoal {
            drv_path,
            state: State::Init,
            derivation: None,
            output_locks: None,
            in_closures: BTreeMap::new(),
            all_paths: BTreeSet::new(),
            input_successors: BTreeMap::new(),
            build_tmp: None,
            hook_declined: false,
        }
    }

    pub(crate) async fn work(goal: &mut Goal, id: GoalId, worker: &mut Worker) -> Result<StepResult> {
        let Goal { core, kind } = goal;
        let GoalKind::Normalization(this) = kind else {
            unreachable!("goal kind mismatch");
        };

        match this.state {
            State::Init => this.init(core, id, worker),
            State::HaveExpr => this.have_expr(core, id, worker),
            State::InputsNormalized => this.inputs_normalized(core, id, worker),
            State::InputsRealized => this.inputs_realized(core),
            State::TryToBuild => this.try_to_build(core, id, worker),
            State::HookDone => this.hook_done(core, worker),
            State::BuildDone => this.build_done(core, worker),
        }
    }

    fn init(&mut self, core: &mut GoalCore, id: GoalId, worker: &mut Worker) -> Result<StepResult> {
        // a registered successor means someone already normalized this
        if worker.store.db.query_successor(&self.drv_path)?.is_some() {
            return Ok(StepResult::Done(true));
        }

        // the expression itself may have to be substituted first
        let substitution = worker.make_substitution_goal(self.drv_path.clone());
        worker.add_waitee(core, id, substitution);
        self.state = State::HaveExpr;
        Ok(StepResult::Waiting)
    }

    fn have_expr(
        &mut self,
        core: &mut GoalCore,
        id: GoalId,
        worker: &mut Worker,
    ) -> Result<StepResult> {
        if core.nr_failed > 0 {
            warn!(drv = %self.drv_path, "cannot normalize missing store expression");
            return Ok(StepResult::Done(false));
        }

        let expr = worker.store.read_store_expr(&self.drv_path)?;
        let derivation = match expr {
            // already a normal form
            StoreExpr::Closure(_) => return Ok(StepResult::Done(true)),
            StoreExpr::Derivation(derivation) => derivation,
        };

        for input in &derivation.inputs {
            let normalization = worker.make_normalization_goal(input.clone());
            worker.add_waitee(core, id, normalization);
        }
        self.derivation = Some(derivation);
        self.state = State::InputsNormalized;
        Ok(StepResult::Waiting)
    }

    fn inputs_normalized(
        &mut self,
        core: &mut GoalCore,
        id: GoalId,
        worker: &mut Worker,
    ) -> Result<StepResult> {
        if core.nr_failed > 0 {
            warn!(
                drv = %self.drv_path,
                failed = core.nr_failed,
                "cannot normalize: inputs failed to normalize"
            );
            return Ok(StepResult::Done(false));
        }

        // now realize the inputs' output closures
        let inputs = self.derivation().inputs.clone();
        for input in inputs {
            let realization = worker.make_realization_goal(input);
            worker.add_waitee(core, id, realization);
        }
        self.state = State::InputsRealized;
        Ok(StepResult::Waiting)
    }

    fn inputs_realized(&mut self, core: &mut GoalCore) -> Result<StepResult> {
        if core.nr_failed > 0 {
            warn!(
                drv = %self.drv_path,
                failed = core.nr_failed,
                "cannot normalize: inputs failed to realize"
            );
            return Ok(StepResult::Done(false));
        }
        self.state = State::TryToBuild;
        Ok(StepResult::Continue)
    }

    fn try_to_build(
        &mut self,
        _core: &mut GoalCore,
        id: GoalId,
        worker: &mut Worker,
    ) -> Result<StepResult> {
        let use_hook = worker.store.settings.build_hook.is_some() && !self.hook_declined;

        // a hook build doesn't occupy a local slot
        if !use_hook && !worker.can_build_more() {
            return Ok(StepResult::WaitForSlot { substitution: false });
        }

        if !self.prepare_build(worker)? {
            // someone else built it while we were waiting for the locks
            return Ok(StepResult::Done(true));
        }

        // everything already valid: register the closure without
        // forking anything
        let outputs = self.derivation().outputs.clone();
        let mut all_valid = true;
        for output in &outputs {
            if !worker.store.db.is_valid(output)? {
                all_valid = false;
                break;
            }
        }
        if all_valid {
            debug!(drv = %self.drv_path, "outputs already exist, skipping build");
            self.create_closure(worker)?;
            return Ok(StepResult::Done(true));
        }

        if use_hook {
            self.start_hook(id, worker)?;
            self.state = State::HookDone;
            return Ok(StepResult::WaitForChild);
        }

        self.start_builder(id, worker)?;
        self.state = State::BuildDone;
        Ok(StepResult::WaitForChild)
    }

    fn hook_done(&mut self, core: &mut GoalCore, worker: &mut Worker) -> Result<StepResult> {
        let status = core.child_status.take().expect("hook status missing");

        match status.code() {
            Some(0) => {
                self.create_closure(worker)?;
                Ok(StepResult::Done(true))
            }
            Some(HOOK_DECLINE) => {
                debug!(drv = %self.drv_path, "hook declined, building locally");
                self.hook_declined = true;
                self.output_locks = None;
                self.state = State::TryToBuild;
                Ok(StepResult::Continue)
            }
            Some(HOOK_POSTPONE) => {
                debug!(drv = %self.drv_path, "hook postponed the build");
                self.output_locks = None;
                self.state = State::TryToBuild;
                Ok(StepResult::PostponeUntilChildExit)
            }
            _ => {
                warn!(drv = %self.drv_path, status = %status, "build hook failed");
                Ok(StepResult::Done(false))
            }
        }
    }

    fn build_done(&mut self, core: &mut GoalCore, worker: &mut Worker) -> Result<StepResult> {
        let status = core.child_status.take().expect("builder status missing");
        let log_path = worker.log_path_for(&self.drv_path);

        if !status.success() {
            worker.stats.builds_failed += 1;
            self.delete_build_tmp(worker, false);
            let status = match core.timed_out.take() {
                Some(reason) => reason.to_string(),
                None => format!("failed with {status}"),
            };
            let error = Error::BuildError {
                drv: self.drv_path.clone(),
                status,
                log_path: Some(log_path.clone()),
            };
            warn!(error = %error, "build failed");
            report_log_tail(&log_path);
            return Ok(StepResult::Done(false));
        }

        self.delete_build_tmp(worker, true);
        self.create_closure(worker)?;
        worker.stats.builds_succeeded += 1;
        Ok(StepResult::Done(true))
    }

    fn derivation(&self) -> &Derivation {
        self.derivation.as_ref().expect("derivation loaded before use")
    }

    /// Acquire the output locks and gather input-closure information.
    /// Returns false when a successor appeared while we were blocked,
    /// meaning someone else's build can be reused as-is.
    fn prepare_build(&mut self, worker: &mut Worker) -> Result<bool> {
        if self.output_locks.is_none() {
            let outputs = self.derivation().outputs.clone();
            let real_paths: Vec<PathBuf> = outputs
                .iter()
                .map(|o| worker.store.real_path(o))
                .collect();
            let mut locks = PathLocks::new();
            let interrupted = worker.interrupted.clone();
            tokio::task::block_in_place(|| {
                locks.lock(real_paths.iter().map(|p| p.as_path()), move || {
                    interrupted.load(std::sync::atomic::Ordering::Relaxed)
                })
            })?;
            self.output_locks = Some(locks);
        }

        if worker.store.db.query_successor(&self.drv_path)?.is_some() {
            debug!(drv = %self.drv_path, "someone beat us to it");
            if let Some(locks) = &mut self.output_locks {
                locks.set_deletion(true);
            }
            self.output_locks = None;
            return Ok(false);
        }

        self.all_paths.clear();
        self.in_closures.clear();
        self.input_successors.clear();
        let outputs = self.derivation().outputs.clone();
        self.all_paths.extend(outputs);

        let inputs = self.derivation().inputs.clone();
        for input in inputs {
            let nf = super::query_normal_form(&worker.store, &input)?;
            if nf != input {
                self.input_successors.insert(input.clone(), nf.clone());
            }
            let closure = worker
                .store
                .read_store_expr(&nf)?
                .as_closure(&nf)?
                .clone();
            for (path, refs) in closure.elems {
                self.all_paths.insert(path.clone());
                self.in_closures.insert(path, refs);
            }
        }

        Ok(true)
    }

    fn start_hook(&mut self, id: GoalId, worker: &mut Worker) -> Result<()> {
        let hook = worker
            .store
            .settings
            .build_hook
            .clone()
            .expect("hook configured");

        // stage the information the hook needs as files in a temp dir
        let tmp = tempfile::Builder::new()
            .prefix("nix-hook-")
            .tempdir_in(worker.store.settings.build_tmp_dir())?;

        let mut inputs = String::new();
        for path in self.in_closures.keys() {
            inputs.push_str(&worker.store.settings.store_dir.display_path(path));
            inputs.push('\n');
        }
        std::fs::write(tmp.path().join("inputs"), inputs)?;

        let mut outputs = String::new();
        for path in &self.derivation().outputs {
            outputs.push_str(&worker.store.settings.store_dir.display_path(path));
            outputs.push('\n');
        }
        std::fs::write(tmp.path().join("outputs"), outputs)?;

        let mut successors = String::new();
        for (drv, nf) in &self.input_successors {
            successors.push_str(&format!("{drv} {nf}\n"));
        }
        std::fs::write(tmp.path().join("successors"), successors)?;

        let mut command = Command::new(hook);
        command
            .arg(if worker.can_build_more() { "1" } else { "0" })
            .arg(&worker.store.settings.system)
            .arg(&self.derivation().platform)
            .arg(worker.store.settings.store_dir.display_path(&self.drv_path))
            .arg(tmp.path());

        let log_path = worker.log_path_for(&self.drv_path);
        worker.child_started(id, command, log_path, false, false)?;
        self.build_tmp = Some(tmp);
        Ok(())
    }

    fn start_builder(&mut self, id: GoalId, worker: &mut Worker) -> Result<()> {
        let derivation = self.derivation().clone();

        if derivation.platform != worker.store.settings.system {
            return Err(Error::BuildError {
                drv: self.drv_path.clone(),
                status: format!(
                    "requires platform {}, but this is a {}",
                    derivation.platform, worker.store.settings.system
                ),
                log_path: None,
            });
        }

        // clear out unregistered leftovers of earlier attempts
        for output in &derivation.outputs {
            if worker.store.db.is_valid(output)? {
                return Err(Error::BuildError {
                    drv: self.drv_path.clone(),
                    status: format!("obstructed build: output {output} is already valid"),
                    log_path: None,
                });
            }
            let real = worker.store.real_path(output);
            if real.symlink_metadata().is_ok() {
                debug!(path = %real.display(), "removing unregistered output");
                delete_path(&real)?;
            }
        }

        let tmp = tempfile::Builder::new()
            .prefix("nix-build-")
            .tempdir_in(worker.store.settings.build_tmp_dir())?;
        let tmp_str = tmp.path().to_string_lossy().into_owned();

        let mut command = Command::new(&derivation.builder);
        command
            .args(&derivation.args)
            .current_dir(tmp.path())
            .env_clear()
            // dummy values: builders must not inherit the caller's world
            .env("PATH", "/path-not-set")
            .env("HOME", "/homeless-shelter")
            .env("NIX_STORE", worker.store.settings.store_dir.as_str())
            .env("NIX_BUILD_TOP", &tmp_str)
            .env("TMPDIR", &tmp_str)
            .env("TEMPDIR", &tmp_str)
            .env("TMP", &tmp_str)
            .env("TEMP", &tmp_str)
            .envs(&derivation.env);

        info!(drv = %self.drv_path, builder = %derivation.builder, "building");
        let log_path = worker.log_path_for(&self.drv_path);
        worker.child_started(id, command, log_path, true, false)?;
        worker.stats.builds_started += 1;
        self.build_tmp = Some(tmp);
        Ok(())
    }

    fn delete_build_tmp(&mut self, worker: &Worker, force: bool) {
        let Some(tmp) = self.build_tmp.take() else {
            return;
        };
        if worker.store.settings.keep_failed && !force {
            let kept = tmp.into_path();
            warn!(drv = %self.drv_path, dir = %kept.display(), "keeping failed build directory");
        }
        // otherwise dropped, which removes it
    }

    /// Scan the outputs, close the reference set, write the normal
    /// form and register everything transactionally.
    fn create_closure(&mut self, worker: &mut Worker) -> Result<()> {
        let derivation = self.derivation().clone();
        let store = worker.store.clone();

        let mut candidates: BTreeMap<[u8; ENCODED_DIGEST_LEN], StorePath> = BTreeMap::new();
        for path in &self.all_paths {
            let digest: [u8; ENCODED_DIGEST_LEN] = path
                .digest_str()
                .into_bytes()
                .try_into()
                .expect("digest part has fixed length");
            candidates.insert(digest, path.clone());
        }

        let mut infos: Vec<PathInfo> = vec![];
        let mut closure = Closure {
            roots: derivation.outputs.clone(),
            ..Default::default()
        };
        let mut used: Vec<StorePath> = vec![];

        for output in &derivation.outputs {
            let real = store.real_path(output);
            if real.symlink_metadata().is_err() {
                return Err(Error::BuildError {
                    drv: self.drv_path.clone(),
                    status: format!("builder failed to produce output path {output}"),
                    log_path: Some(worker.log_path_for(&self.drv_path)),
                });
            }

            if !store.db.is_valid(output)? {
                make_read_only(&real)?;
            }

            debug!(output = %output, "scanning for references");
            let (references, nar_hash, nar_size) = store.scan_for_references(&real, &candidates)?;

            for reference in &references {
                if self.in_closures.contains_key(reference) {
                    used.push(reference.clone());
                } else if !derivation.outputs.contains(reference) {
                    return Err(Error::BuildError {
                        drv: self.drv_path.clone(),
                        status: format!("output references untracked path {reference}"),
                        log_path: None,
                    });
                }
            }

            closure.elems.insert(output.clone(), references.iter().cloned().collect());

            let mut info = PathInfo::new(output.clone(), nar_hash, nar_size);
            info.references = references;
            info.deriver = Some(self.drv_path.clone());
            info.ultimate = true;
            infos.push(info);
        }

        // close the closure: pull in everything the used inputs need
        let mut done: BTreeSet<StorePath> = BTreeSet::new();
        while let Some(path) = used.pop() {
            if !done.insert(path.clone()) {
                continue;
            }
            let refs = self
                .in_closures
                .get(&path)
                .cloned()
                .unwrap_or_default();
            used.extend(refs.iter().cloned());
            closure.elems.insert(path, refs);
        }

        let nf_name = format!(
            "{}.closure",
            self.drv_path.name().trim_end_matches(".drv")
        );
        let nf_path = store.write_store_expr(&nf_name, &StoreExpr::Closure(closure))?;

        // sign like any locally produced path
        for key in store.signing_keys() {
            for info in &mut infos {
                info.sign(&store.settings.store_dir, key);
            }
        }

        store
            .db
            .register_build_results(&infos, &self.drv_path, &nf_path)?;

        if let Some(locks) = &mut self.output_locks {
            locks.set_deletion(true);
        }
        self.output_locks = None;

        info!(drv = %self.drv_path, nf = %nf_path, "normal form registered");
        Ok(())
    }
}

/// Show the last lines of a failed build's log, the way a user will
/// want to see them.
fn report_log_tail(log_path: &std::path::Path) {
    const TAIL: usize = 25;
    let Ok(contents) = std::fs::read_to_string(log_path) else {
        return;
    };
    let lines: Vec<&str> = contents.lines().collect();
    for line in lines.iter().rev().take(TAIL).rev() {
        info!(target: "build-log", "{line}");
    }
}
