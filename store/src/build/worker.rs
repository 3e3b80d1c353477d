//! The goal scheduler.
//!
//! One task owns every goal. Goals run cooperatively: `work()`
//! advances a goal by exactly one state and returns how the goal wants
//! to be resumed. Child processes are pumped by helper tasks that feed
//! an event channel; the worker loop is the only consumer.

use std::collections::{BTreeSet, HashMap};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use nixwire::store_path::StorePath;

use crate::error::{Error, Result};
use crate::local::LocalStore;

use super::normalization::NormalizationGoal;
use super::realization::RealizationGoal;
use super::substitution::SubstitutionGoal;

pub type GoalId = usize;

/// What a goal's step asks the worker to do with it next.
pub enum StepResult {
    /// Parked until its waitees finish (or it was woken explicitly).
    Waiting,
    /// Runnable again right away.
    Continue,
    /// Parked until a build slot (and, for substitution goals, a
    /// substitution slot) frees up.
    WaitForSlot { substitution: bool },
    /// Parked until its child terminates.
    WaitForChild,
    /// Parked until *some* child terminates, even if slots are free
    /// (a postponing build hook asked us to wait for load to drop).
    PostponeUntilChildExit,
    Done(bool),
}

pub struct GoalCore {
    pub waiters: Vec<GoalId>,
    pub waitees: BTreeSet<GoalId>,
    /// Waitees that finished unsuccessfully since the last state.
    pub nr_failed: usize,
    /// Exit status of this goal's child, once reaped.
    pub child_status: Option<ExitStatus>,
    /// Set when the worker killed the child for exceeding a timeout.
    pub timed_out: Option<&'static str>,
}

impl GoalCore {
    fn new() -> Self {
        GoalCore {
            waiters: vec![],
            waitees: BTreeSet::new(),
            nr_failed: 0,
            child_status: None,
            timed_out: None,
        }
    }
}

pub enum GoalKind {
    Normalization(NormalizationGoal),
    Realization(RealizationGoal),
    Substitution(SubstitutionGoal),
}

pub struct Goal {
    pub core: GoalCore,
    pub kind: GoalKind,
}

impl Goal {
    fn name(&self) -> String {
        match &self.kind {
            GoalKind::Normalization(g) => format!("normalization of {}", g.drv_path),
            GoalKind::Realization(g) => format!("realization of {}", g.drv_path),
            GoalKind::Substitution(g) => format!("substitution of {}", g.store_path),
        }
    }
}

pub(crate) enum WorkerEvent {
    ChildOutput { goal: GoalId },
    ChildEof { goal: GoalId, status: std::io::Result<ExitStatus> },
    Interrupted,
}

struct Child {
    in_build_slot: bool,
    is_substitution: bool,
    kill: Option<oneshot::Sender<()>>,
    last_output: Instant,
    started: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub substitutions_started: u64,
    pub substitutions_succeeded: u64,
    pub substitutions_failed: u64,
}

pub struct Worker {
    pub(crate) store: Arc<LocalStore>,

    goals: Vec<Option<Goal>>,
    outcomes: HashMap<GoalId, bool>,
    top_goals: BTreeSet<GoalId>,

    awake: BTreeSet<GoalId>,
    wanting_to_build: BTreeSet<GoalId>,
    children: HashMap<GoalId, Child>,
    nr_slotted: u32,
    nr_substitutions: u32,

    // one goal per key; completed goals are re-created on demand
    normalization_goals: HashMap<StorePath, GoalId>,
    realization_goals: HashMap<StorePath, GoalId>,
    substitution_goals: HashMap<StorePath, GoalId>,

    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,

    pub interrupted: Arc<AtomicBool>,
    pub stats: WorkerStats,
}

impl Worker {
    pub fn new(store: Arc<LocalStore>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Worker {
            store,
            goals: vec![],
            outcomes: HashMap::new(),
            top_goals: BTreeSet::new(),
            awake: BTreeSet::new(),
            wanting_to_build: BTreeSet::new(),
            children: HashMap::new(),
            nr_slotted: 0,
            nr_substitutions: 0,
            normalization_goals: HashMap::new(),
            realization_goals: HashMap::new(),
            substitution_goals: HashMap::new(),
            events_tx,
            events_rx,
            interrupted: Arc::new(AtomicBool::new(false)),
            stats: WorkerStats::default(),
        }
    }

    fn alloc(&mut self, kind: GoalKind) -> GoalId {
        let id = self.goals.len();
        self.goals.push(Some(Goal {
            core: GoalCore::new(),
            kind,
        }));
        self.awake.insert(id);
        id
    }

    fn cached_goal(
        map: &HashMap<StorePath, GoalId>,
        goals: &[Option<Goal>],
        key: &StorePath,
    ) -> Option<GoalId> {
        map.get(key).copied().filter(|id| goals[*id].is_some())
    }

    pub fn make_normalization_goal(&mut self, drv_path: StorePath) -> GoalId {
        if let Some(id) = Self::cached_goal(&self.normalization_goals, &self.goals, &drv_path) {
            return id;
        }
        let id = self.alloc(GoalKind::Normalization(NormalizationGoal::new(
            drv_path.clone(),
        )));
        self.normalization_goals.insert(drv_path, id);
        id
    }

    pub fn make_realization_goal(&mut self, drv_path: StorePath) -> GoalId {
        if let Some(id) = Self::cached_goal(&self.realization_goals, &self.goals, &drv_path) {
            return id;
        }
        let id = self.alloc(GoalKind::Realization(RealizationGoal::new(
            drv_path.clone(),
            self.store.settings.try_fallback,
        )));
        self.realization_goals.insert(drv_path, id);
        id
    }

    pub fn make_substitution_goal(&mut self, store_path: StorePath) -> GoalId {
        if let Some(id) = Self::cached_goal(&self.substitution_goals, &self.goals, &store_path) {
            return id;
        }
        let id = self.alloc(GoalKind::Substitution(SubstitutionGoal::new(
            store_path.clone(),
        )));
        self.substitution_goals.insert(store_path, id);
        id
    }

    /// Record that the goal currently being stepped (hence its core is
    /// passed explicitly) waits on `waitee`.
    pub fn add_waitee(&mut self, core: &mut GoalCore, goal_id: GoalId, waitee: GoalId) {
        if let Some(outcome) = self.outcomes.get(&waitee) {
            // the waitee already ran to completion in this worker
            if !*outcome {
                core.nr_failed += 1;
            }
            return;
        }
        core.waitees.insert(waitee);
        let waitee = self.goals[waitee]
            .as_mut()
            .expect("waitee vanished without outcome");
        waitee.core.waiters.push(goal_id);
    }

    pub fn wake_up(&mut self, id: GoalId) {
        trace!(goal = id, "woken up");
        self.awake.insert(id);
    }

    pub fn can_build_more(&self) -> bool {
        self.nr_slotted < self.store.settings.max_build_jobs
    }

    pub fn can_substitute_more(&self) -> bool {
        self.nr_substitutions < self.store.settings.max_substitution_jobs
    }

    pub fn wait_for_build_slot(&mut self, id: GoalId) {
        debug!(goal = id, "waiting for a build slot");
        self.wanting_to_build.insert(id);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    /// Launch a child whose merged output is appended to `log_path`.
    /// EOF on the output is what signals termination to the goal.
    pub fn child_started(
        &mut self,
        id: GoalId,
        mut command: Command,
        log_path: std::path::PathBuf,
        in_build_slot: bool,
        is_substitution: bool,
    ) -> Result<()> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let (kill_tx, kill_rx) = oneshot::channel();

        let events = self.events_tx.clone();
        tokio::spawn(pump_child(id, child, stdout, stderr, log_path, events, kill_rx));

        self.children.insert(
            id,
            Child {
                in_build_slot,
                is_substitution,
                kill: Some(kill_tx),
                last_output: Instant::now(),
                started: Instant::now(),
            },
        );
        if in_build_slot {
            self.nr_slotted += 1;
        }
        if is_substitution {
            self.nr_substitutions += 1;
        }
        Ok(())
    }

    fn child_terminated(&mut self, id: GoalId) {
        let Some(child) = self.children.remove(&id) else {
            return;
        };
        if child.in_build_slot {
            self.nr_slotted -= 1;
        }
        if child.is_substitution {
            self.nr_substitutions -= 1;
        }
        // every slot-waiter gets a chance; losers re-park themselves
        let waiting: Vec<GoalId> = self.wanting_to_build.iter().copied().collect();
        self.wanting_to_build.clear();
        for goal in waiting {
            self.wake_up(goal);
        }
    }

    /// Run until every top-level goal finished. Returns true iff all
    /// of them succeeded.
    #[instrument(skip_all)]
    pub async fn run(&mut self, top_goals: Vec<GoalId>) -> Result<bool> {
        // ctrl-c sets the flag; goals observe it between steps
        let interrupter = self.interrupter();
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupter();
            }
        });

        let result = self.run_inner(top_goals).await;
        signal_task.abort();
        result
    }

    async fn run_inner(&mut self, top_goals: Vec<GoalId>) -> Result<bool> {
        self.top_goals = top_goals.iter().copied().collect();
        let mut all_ok = true;

        loop {
            if self.interrupted() {
                self.kill_children();
                return Err(Error::Interrupted);
            }

            while let Some(id) = self.awake.pop_first() {
                if self.interrupted() {
                    self.kill_children();
                    return Err(Error::Interrupted);
                }
                if self.goals[id].is_none() {
                    continue;
                }
                self.step_goal(id).await?;
            }

            // collect finished top-level goals
            let done: Vec<GoalId> = self
                .top_goals
                .iter()
                .copied()
                .filter(|id| self.outcomes.contains_key(id))
                .collect();
            for id in done {
                self.top_goals.remove(&id);
                if !self.outcomes[&id] {
                    all_ok = false;
                }
            }
            if self.top_goals.is_empty() {
                break;
            }

            if self.awake.is_empty() {
                if self.children.is_empty() {
                    return Err(Error::UsageError(
                        "scheduler stalled: goals outstanding but nothing to wait for \
                         (is max-jobs set to 0 without a build hook?)"
                            .to_string(),
                    ));
                }
                self.wait_for_input().await?;
            }
        }

        Ok(all_ok)
    }

    /// Block for child events, enforcing the build timeouts.
    async fn wait_for_input(&mut self) -> Result<()> {
        let timeout = self.next_deadline();
        let event = match timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.events_rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        self.enforce_timeouts();
                        return Ok(());
                    }
                }
            }
            None => self.events_rx.recv().await,
        };

        match event.expect("event channel closed with live children") {
            WorkerEvent::ChildOutput { goal } => {
                if let Some(child) = self.children.get_mut(&goal) {
                    child.last_output = Instant::now();
                }
            }
            WorkerEvent::ChildEof { goal, status } => {
                debug!(goal, "child terminated");
                self.child_terminated(goal);
                if let Some(slot) = self.goals.get_mut(goal).and_then(|g| g.as_mut()) {
                    slot.core.child_status = Some(status.unwrap_or_else(|_| {
                        // reap failure: synthesize a failed status
                        std::os::unix::process::ExitStatusExt::from_raw(-1)
                    }));
                    self.wake_up(goal);
                }
            }
            WorkerEvent::Interrupted => {}
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Duration> {
        let settings = &self.store.settings;
        let mut next: Option<Duration> = None;
        let now = Instant::now();
        for child in self.children.values() {
            if let Some(max_silent) = settings.max_silent_time {
                let left = max_silent.saturating_sub(now - child.last_output);
                next = Some(next.map_or(left, |n| n.min(left)));
            }
            if let Some(timeout) = settings.build_timeout {
                let left = timeout.saturating_sub(now - child.started);
                next = Some(next.map_or(left, |n| n.min(left)));
            }
        }
        next
    }

    fn enforce_timeouts(&mut self) {
        let max_silent = self.store.settings.max_silent_time;
        let build_timeout = self.store.settings.build_timeout;
        let now = Instant::now();
        let mut expired = vec![];
        for (id, child) in &self.children {
            if let Some(max_silent) = max_silent {
                if now - child.last_output >= max_silent {
                    expired.push((*id, "max-silent-time exceeded"));
                    continue;
                }
            }
            if let Some(timeout) = build_timeout {
                if now - child.started >= timeout {
                    expired.push((*id, "build timeout exceeded"));
                }
            }
        }
        for (id, reason) in expired {
            warn!(goal = id, reason, "killing child");
            if let Some(child) = self.children.get_mut(&id) {
                if let Some(kill) = child.kill.take() {
                    let _ = kill.send(());
                }
            }
            if let Some(goal) = self.goals.get_mut(id).and_then(|g| g.as_mut()) {
                goal.core.timed_out = Some(reason);
            }
        }
    }

    fn kill_children(&mut self) {
        for child in self.children.values_mut() {
            if let Some(kill) = child.kill.take() {
                let _ = kill.send(());
            }
        }
    }

    async fn step_goal(&mut self, id: GoalId) -> Result<()> {
        let mut goal = self.goals[id].take().expect("stepping a dead goal");
        trace!(goal = id, name = %goal.name(), "work");

        let result = match &mut goal.kind {
            GoalKind::Normalization(_) => NormalizationGoal::work(&mut goal, id, self).await,
            GoalKind::Realization(_) => RealizationGoal::work(&mut goal, id, self).await,
            GoalKind::Substitution(_) => SubstitutionGoal::work(&mut goal, id, self).await,
        };

        match result {
            Ok(StepResult::Done(success)) => {
                self.finish_goal(id, goal, success);
            }
            Ok(StepResult::Continue) => {
                self.goals[id] = Some(goal);
                self.awake.insert(id);
            }
            Ok(StepResult::Waiting) => {
                if goal.core.waitees.is_empty() {
                    // everything it waited for is already done
                    self.awake.insert(id);
                }
                self.goals[id] = Some(goal);
            }
            Ok(StepResult::WaitForSlot { substitution }) => {
                self.goals[id] = Some(goal);
                let admissible = self.can_build_more()
                    && (!substitution || self.can_substitute_more());
                if admissible {
                    self.awake.insert(id);
                } else {
                    self.wait_for_build_slot(id);
                }
            }
            Ok(StepResult::WaitForChild) => {
                self.goals[id] = Some(goal);
            }
            Ok(StepResult::PostponeUntilChildExit) => {
                self.goals[id] = Some(goal);
                if self.children.is_empty() {
                    return Err(Error::UsageError(
                        "build hook postponed, yet there are no running children".to_string(),
                    ));
                }
                self.wanting_to_build.insert(id);
            }
            Err(e) if e.is_transient() => {
                warn!(goal = id, error = %e, "transient failure, retrying goal step");
                self.goals[id] = Some(goal);
                self.awake.insert(id);
            }
            Err(e) => {
                warn!(goal = id, name = %goal.name(), error = %e, "goal failed");
                self.finish_goal(id, goal, false);
            }
        }
        Ok(())
    }

    fn finish_goal(&mut self, id: GoalId, goal: Goal, success: bool) {
        debug!(goal = id, name = %goal.name(), success, "goal finished");
        self.outcomes.insert(id, success);

        let keep_going = self.store.settings.keep_going;
        if !success && !keep_going {
            // siblings are abandoned wholesale: stop their children too
            self.kill_children();
        }
        for waiter_id in goal.core.waiters {
            let Some(waiter) = self.goals.get_mut(waiter_id).and_then(|g| g.as_mut()) else {
                continue;
            };
            if !waiter.core.waitees.remove(&id) {
                continue;
            }
            if !success {
                waiter.core.nr_failed += 1;
            }

            if waiter.core.waitees.is_empty() || (!success && !keep_going) {
                // failure without keep-going: drop the waiter's other
                // waitees; they keep running but nobody observes them
                let orphaned: Vec<GoalId> = waiter.core.waitees.iter().copied().collect();
                waiter.core.waitees.clear();
                for waitee_id in orphaned {
                    if let Some(waitee) = self.goals.get_mut(waitee_id).and_then(|g| g.as_mut()) {
                        waitee.core.waiters.retain(|w| *w != waiter_id);
                    }
                }
                self.wake_up(waiter_id);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // don't leave builders running past their scheduler
        self.kill_children();
    }
}

/// Forward a child's merged stdout/stderr into its log file, then
/// report EOF with the exit status. A kill request sends SIGTERM and
/// escalates to SIGKILL after a grace period.
async fn pump_child(
    goal: GoalId,
    mut child: tokio::process::Child,
    mut stdout: tokio::process::ChildStdout,
    mut stderr: tokio::process::ChildStderr,
    log_path: std::path::PathBuf,
    events: mpsc::UnboundedSender<WorkerEvent>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    const KILL_GRACE: Duration = Duration::from_secs(5);

    let mut log = match tokio::fs::File::create(&log_path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(log = %log_path.display(), error = %e, "cannot open log file");
            None
        }
    };

    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;
    let mut killing = false;

    while out_open || err_open {
        tokio::select! {
            n = stdout.read(&mut out_buf), if out_open => match n {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    if let Some(log) = &mut log {
                        let _ = log.write_all(&out_buf[..n]).await;
                    }
                    let _ = events.send(WorkerEvent::ChildOutput { goal });
                }
            },
            n = stderr.read(&mut err_buf), if err_open => match n {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => {
                    if let Some(log) = &mut log {
                        let _ = log.write_all(&err_buf[..n]).await;
                    }
                    let _ = events.send(WorkerEvent::ChildOutput { goal });
                }
            },
            _ = &mut kill_rx, if !killing => {
                killing = true;
                terminate(&child);
                tokio::time::sleep(KILL_GRACE).await;
                let _ = child.start_kill();
                break;
            }
        }
    }

    if let Some(log) = &mut log {
        let _ = log.flush().await;
    }
    let status = child.wait().await;
    let _ = events.send(WorkerEvent::ChildEof { goal, status });
}

fn terminate(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

impl Worker {
    /// Shared helper for goals that need a per-goal log file.
    pub(crate) fn log_path_for(&self, path: &StorePath) -> std::path::PathBuf {
        self.store.settings.log_dir.join(path.to_string())
    }

    /// Handle for an external interrupt source (the CLI's ctrl-c
    /// handler): set the flag, then send the event to wake the loop.
    pub fn interrupter(&self) -> impl Fn() + Send + Sync + 'static {
        let flag = self.interrupted.clone();
        let events = self.events_tx.clone();
        move || {
            flag.store(true, Ordering::Relaxed);
            let _ = events.send(WorkerEvent::Interrupted);
        }
    }
}
