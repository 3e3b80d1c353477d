//! The realization goal: make a derivation's output closure exist,
//! substituting closure elements where possible and falling back to a
//! fresh build when allowed.

use tracing::warn;

use nixwire::store_path::StorePath;

use crate::error::Result;

use super::worker::{Goal, GoalCore, GoalId, GoalKind, StepResult, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Init,
    IsNormalized,
    HaveExpr,
    ElemFinished,
}

pub struct RealizationGoal {
    pub drv_path: StorePath,
    nf_path: Option<StorePath>,
    /// Invalidate a broken successor and rebuild when substitution of
    /// its elements fails.
    try_fallback: bool,
    state: State,
}

impl RealizationGoal {
    pub fn new(drv_path: StorePath, try_fallback: bool) -> Self {
        RealizationGoal {
            drv_path,
            nf_path: None,
            try_fallback,
            state: State::Init,
        }
    }

    pub(crate) async fn work(goal: &mut Goal, id: GoalId, worker: &mut Worker) -> Result<StepResult> {
        let Goal { core, kind } = goal;
        let GoalKind::Realization(this) = kind else {
            unreachable!("goal kind mismatch");
        };

        match this.state {
            State::Init => this.init(core, id, worker),
            State::IsNormalized => this.is_normalized(core, id, worker),
            State::HaveExpr => this.have_expr(core, id, worker),
            State::ElemFinished => this.elem_finished(core, worker),
        }
    }

    fn init(&mut self, core: &mut GoalCore, id: GoalId, worker: &mut Worker) -> Result<StepResult> {
        if worker.store.db.query_successor(&self.drv_path)?.is_some() {
            core.nr_failed = 0;
            self.state = State::IsNormalized;
            return Ok(StepResult::Continue);
        }

        // no successor: normalization will actually build, so a
        // substitution fallback cannot achieve anything more
        self.try_fallback = false;
        let normalization = worker.make_normalization_goal(self.drv_path.clone());
        worker.add_waitee(core, id, normalization);
        self.state = State::IsNormalized;
        Ok(StepResult::Waiting)
    }

    fn is_normalized(
        &mut self,
        core: &mut GoalCore,
        id: GoalId,
        worker: &mut Worker,
    ) -> Result<StepResult> {
        if core.nr_failed > 0 {
            return Ok(StepResult::Done(false));
        }

        let nf = super::query_normal_form(&worker.store, &self.drv_path)?;
        self.nf_path = Some(nf.clone());

        // the normal form itself may have to be substituted
        let substitution = worker.make_substitution_goal(nf);
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
        let nf = self.nf_path.clone().expect("normal form resolved");
        if core.nr_failed > 0 {
            return self.fall_back(core, worker, &format!("closure expression {nf} is missing"));
        }

        let closure = worker.store.read_store_expr(&nf)?.as_closure(&nf)?.clone();
        for path in closure.elems.keys() {
            let substitution = worker.make_substitution_goal(path.clone());
            worker.add_waitee(core, id, substitution);
        }
        self.state = State::ElemFinished;
        Ok(StepResult::Waiting)
    }

    fn elem_finished(&mut self, core: &mut GoalCore, worker: &mut Worker) -> Result<StepResult> {
        if core.nr_failed > 0 {
            let failed = core.nr_failed;
            return self.fall_back(
                core,
                worker,
                &format!("{failed} closure element(s) could not be substituted"),
            );
        }
        Ok(StepResult::Done(true))
    }

    fn fall_back(
        &mut self,
        core: &mut GoalCore,
        worker: &mut Worker,
        reason: &str,
    ) -> Result<StepResult> {
        let nf = self.nf_path.clone().expect("normal form resolved");
        if self.try_fallback && self.drv_path != nf {
            warn!(
                drv = %self.drv_path,
                reason,
                "substitution failed, normalizing the derivation instead"
            );
            self.try_fallback = false;
            worker.store.db.unregister_successor(&self.drv_path)?;
            core.nr_failed = 0;
            self.nf_path = None;
            self.state = State::Init;
            Ok(StepResult::Continue)
        } else {
            warn!(drv = %self.drv_path, reason, "realization failed; maybe try-fallback would help");
            Ok(StepResult::Done(false))
        }
    }
}
