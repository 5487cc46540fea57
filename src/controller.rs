//! Mode controller: per-step sequencing of retrieval and update.
//!
//! One controller drives one agent's decision loop. An episode runs in a
//! single [`ExecutionMode`], fixed until [`ModeController::end_episode`]:
//!
//! - `JointRetrieveUpdate`: evidence applies as soon as it is submitted and
//!   overwrites any cached copy retrieved earlier in the step.
//! - `DecoupledRetrieveFirst`: evidence is queued and applied at `end_step`,
//!   after the step's retrievals.
//! - `DecoupledUpdateFirst`: evidence is queued and applied at the next
//!   `begin_step`, so retrievals never see same-step updates.
//!
//! A throughput guard caps applied updates per window of steps. Submissions
//! over the cap stay queued, oldest first, and are never dropped.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::engine::{Engine, GraphStoreHandle};
use crate::error::{ControllerError, GraphError, KgResult};
use crate::graph::store::DecayReport;
use crate::graph::{Fact, FactKey};
use crate::memory::{MemoryStats, MemoryTiers};
use crate::retrieve::{Query, RankedFacts, ScoredFact};
use crate::update::{CandidateFact, UpdateOutcome};

/// How retrieval and update are ordered within a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[default]
    JointRetrieveUpdate,
    DecoupledRetrieveFirst,
    DecoupledUpdateFirst,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::JointRetrieveUpdate => "joint retrieve/update",
            ExecutionMode::DecoupledRetrieveFirst => "decoupled retrieve-first",
            ExecutionMode::DecoupledUpdateFirst => "decoupled update-first",
        };
        f.write_str(s)
    }
}

/// Identifies a queued submission until it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What happened to a submission right away.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Applied(UpdateOutcome),
    /// Applied later; look for the ticket in a step or episode report.
    Queued(Ticket),
}

/// A queued submission that has now been applied.
#[derive(Debug)]
pub struct FlushedUpdate {
    pub ticket: Ticket,
    pub key: FactKey,
    pub submitted_step: u64,
    pub applied_step: u64,
    pub outcome: Result<UpdateOutcome, GraphError>,
}

/// Work done at a step boundary.
#[derive(Debug, Default)]
pub struct StepReport {
    pub step: u64,
    pub flushed: Vec<FlushedUpdate>,
    pub decay: Option<DecayReport>,
    /// Submissions still queued afterwards.
    pub pending: usize,
}

#[derive(Debug)]
pub struct EpisodeReport {
    pub mode: ExecutionMode,
    pub steps: u64,
    pub flushed: Vec<FlushedUpdate>,
    pub memory: MemoryStats,
}

/// Anything that answers queries for an agent.
pub trait RetrieverClient {
    fn retrieve(&mut self, query: &Query) -> KgResult<RankedFacts>;
}

/// Anything that accepts evidence from an agent.
pub trait UpdaterClient {
    fn submit(&mut self, candidate: CandidateFact) -> KgResult<Submission>;
}

/// Direct engine access: no memory, no queueing.
impl RetrieverClient for &Engine {
    fn retrieve(&mut self, query: &Query) -> KgResult<RankedFacts> {
        Engine::retrieve(*self, query)
    }
}

impl UpdaterClient for &Engine {
    fn submit(&mut self, candidate: CandidateFact) -> KgResult<Submission> {
        Ok(Submission::Applied(self.submit_evidence(&candidate)?))
    }
}

struct Pending {
    ticket: Ticket,
    candidate: CandidateFact,
    submitted_step: u64,
}

/// Step/episode state machine in front of a shared engine.
pub struct ModeController {
    engine: GraphStoreHandle,
    config: ControllerConfig,
    memory: MemoryTiers,
    /// `Some` while an episode runs.
    mode: Option<ExecutionMode>,
    step: u64,
    in_step: bool,
    pending: VecDeque<Pending>,
    next_ticket: u64,
    window: u64,
    applied_in_window: usize,
}

impl ModeController {
    pub fn new(engine: GraphStoreHandle) -> Self {
        let config = engine.config().controller.clone();
        let memory = MemoryTiers::new(&engine.config().memory);
        Self {
            engine,
            config,
            memory,
            mode: None,
            step: 0,
            in_step: false,
            pending: VecDeque::new(),
            next_ticket: 1,
            window: 0,
            applied_in_window: 0,
        }
    }

    /// Start an episode in the configured default mode.
    pub fn start_default_episode(&mut self) -> KgResult<()> {
        self.start_episode(self.config.mode)
    }

    /// Start an episode. The mode stays fixed until `end_episode`.
    pub fn start_episode(&mut self, mode: ExecutionMode) -> KgResult<()> {
        if let Some(current) = self.mode {
            return Err(ControllerError::ModeLocked {
                current: current.to_string(),
            }
            .into());
        }
        self.mode = Some(mode);
        self.step = 0;
        self.in_step = false;
        self.window = 0;
        self.applied_in_window = 0;
        tracing::info!(%mode, "episode started");
        Ok(())
    }

    fn active_mode(&self) -> KgResult<ExecutionMode> {
        self.mode.ok_or_else(|| ControllerError::NoActiveEpisode.into())
    }

    fn require_step(&self) -> KgResult<ExecutionMode> {
        let mode = self.active_mode()?;
        if !self.in_step {
            return Err(ControllerError::NoActiveStep.into());
        }
        Ok(mode)
    }

    /// Open the next step. Update-first and joint episodes apply queued
    /// evidence here, within the window's budget.
    pub fn begin_step(&mut self) -> KgResult<StepReport> {
        let mode = self.active_mode()?;
        if self.in_step {
            return Err(ControllerError::StepInProgress { step: self.step }.into());
        }
        self.step += 1;
        self.in_step = true;

        let window = (self.step - 1) / self.config.update_window_steps;
        if window != self.window {
            self.window = window;
            self.applied_in_window = 0;
        }

        let flushed = match mode {
            ExecutionMode::JointRetrieveUpdate | ExecutionMode::DecoupledUpdateFirst => {
                self.flush(true)
            }
            ExecutionMode::DecoupledRetrieveFirst => Vec::new(),
        };
        Ok(StepReport {
            step: self.step,
            flushed,
            decay: None,
            pending: self.pending.len(),
        })
    }

    /// Answer a query, from memory when the cached copies suffice.
    pub fn retrieve(&mut self, query: &Query) -> KgResult<RankedFacts> {
        self.require_step()?;
        let k = self.engine.config().retrieval.max_results;
        let floor = self.engine.config().update.soft_retire_floor;

        if let Some(hits) = self.memory.recall(self.engine.graph(), query, k, floor) {
            let facts = hits
                .into_iter()
                .map(|(fact, overlap)| ScoredFact {
                    fact,
                    score: overlap,
                    similarity: 0.0,
                    keyword_overlap: overlap,
                })
                .collect();
            return Ok(RankedFacts {
                facts,
                from_memory: true,
                ..Default::default()
            });
        }

        let ranked = self.engine.retrieve(query)?;
        let facts: Vec<Fact> = ranked.iter().cloned().collect();
        self.memory.write_back(&facts, self.step);
        Ok(ranked)
    }

    /// Hand evidence to the engine. Joint episodes apply it now if the
    /// window has budget left; otherwise it is queued.
    pub fn submit(&mut self, candidate: CandidateFact) -> KgResult<Submission> {
        let mode = self.require_step()?;
        if mode == ExecutionMode::JointRetrieveUpdate && self.pending.is_empty() && self.has_budget()
        {
            let outcome = self.apply(&candidate)?;
            return Ok(Submission::Applied(outcome));
        }

        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        tracing::debug!(%ticket, step = self.step, %mode, "evidence queued");
        self.pending.push_back(Pending {
            ticket,
            candidate,
            submitted_step: self.step,
        });
        Ok(Submission::Queued(ticket))
    }

    /// Close the step. Retrieve-first episodes apply queued evidence here;
    /// a decay sweep runs when one is due.
    pub fn end_step(&mut self) -> KgResult<StepReport> {
        let mode = self.require_step()?;
        let flushed = match mode {
            ExecutionMode::DecoupledRetrieveFirst => self.flush(true),
            _ => Vec::new(),
        };

        let decay = match self.config.decay_every_steps {
            Some(every) if self.step % every == 0 => {
                let report = self.engine.decay_sweep();
                let floor = self.engine.config().update.soft_retire_floor;
                let dropped = self.memory.refresh(self.engine.graph(), floor);
                tracing::debug!(
                    step = self.step,
                    decayed = report.decayed,
                    retired = report.retired.len(),
                    dropped,
                    "decay sweep"
                );
                Some(report)
            }
            _ => None,
        };

        self.in_step = false;
        Ok(StepReport {
            step: self.step,
            flushed,
            decay,
            pending: self.pending.len(),
        })
    }

    /// Apply everything still queued regardless of the throughput guard,
    /// demote the short memory tier, and unlock the mode.
    pub fn end_episode(&mut self) -> KgResult<EpisodeReport> {
        let mode = self.active_mode()?;
        if self.in_step {
            return Err(ControllerError::StepInProgress { step: self.step }.into());
        }
        let flushed = self.flush(false);
        self.memory.end_episode();
        self.mode = None;
        tracing::info!(%mode, steps = self.step, flushed = flushed.len(), "episode ended");
        Ok(EpisodeReport {
            mode,
            steps: self.step,
            flushed,
            memory: self.memory.stats(),
        })
    }

    fn has_budget(&self) -> bool {
        self.applied_in_window < self.config.max_updates_per_window
    }

    fn flush(&mut self, respect_budget: bool) -> Vec<FlushedUpdate> {
        let mut flushed = Vec::new();
        loop {
            if respect_budget && !self.has_budget() {
                break;
            }
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            let outcome = self.apply(&pending.candidate);
            if let Err(ref e) = outcome {
                tracing::warn!(ticket = %pending.ticket, error = %e, "queued evidence failed");
            }
            flushed.push(FlushedUpdate {
                ticket: pending.ticket,
                key: pending.candidate.key(),
                submitted_step: pending.submitted_step,
                applied_step: self.step,
                outcome,
            });
        }
        flushed
    }

    /// Apply one submission and refresh the cached copies it touched.
    fn apply(&mut self, candidate: &CandidateFact) -> Result<UpdateOutcome, GraphError> {
        self.applied_in_window += 1;
        let outcome = self.engine.updater().submit_evidence(candidate)?;
        let touched: Vec<Fact> = match &outcome {
            UpdateOutcome::Accepted(fact) | UpdateOutcome::Merged(fact) => vec![fact.clone()],
            UpdateOutcome::Conflicted { survivor, losers } => std::iter::once(survivor)
                .chain(losers.iter())
                .cloned()
                .collect(),
            UpdateOutcome::Rejected(_) => Vec::new(),
        };
        self.memory.write_back(&touched, self.step);
        Ok(outcome)
    }

    pub fn mode(&self) -> Option<ExecutionMode> {
        self.mode
    }

    /// Current (or last) step number within the episode, starting at 1.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn memory(&self) -> &MemoryTiers {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryTiers {
        &mut self.memory
    }

    pub fn engine(&self) -> &GraphStoreHandle {
        &self.engine
    }
}

impl RetrieverClient for ModeController {
    fn retrieve(&mut self, query: &Query) -> KgResult<RankedFacts> {
        ModeController::retrieve(self, query)
    }
}

impl UpdaterClient for ModeController {
    fn submit(&mut self, candidate: CandidateFact) -> KgResult<Submission> {
        ModeController::submit(self, candidate)
    }
}

impl std::fmt::Debug for ModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeController")
            .field("mode", &self.mode)
            .field("step", &self.step)
            .field("in_step", &self.in_step)
            .field("pending", &self.pending.len())
            .field("memory", &self.memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::error::KgError;
    use crate::graph::{NodeSpec, Relation};
    use crate::memory::Tier;

    fn engine_with(f: impl FnOnce(&mut EngineConfig)) -> GraphStoreHandle {
        let mut config = EngineConfig::default();
        f(&mut config);
        Arc::new(Engine::new(config).unwrap())
    }

    fn contains(s: &str, o: &str, confidence: f32) -> CandidateFact {
        CandidateFact::new(
            NodeSpec::entity(s),
            Relation::Contains,
            NodeSpec::entity(o),
            confidence,
        )
    }

    fn sees(controller: &mut ModeController, word: &str) -> bool {
        !controller
            .retrieve(&Query::keyword(&[word]))
            .unwrap()
            .is_empty()
    }

    #[test]
    fn state_machine_misuse() {
        let mut c = ModeController::new(engine_with(|_| {}));
        assert!(matches!(
            c.begin_step(),
            Err(KgError::Controller(ControllerError::NoActiveEpisode))
        ));
        c.start_default_episode().unwrap();
        assert_eq!(c.mode(), Some(ExecutionMode::JointRetrieveUpdate));
        assert!(matches!(
            c.retrieve(&Query::keyword(&["x"])),
            Err(KgError::Controller(ControllerError::NoActiveStep))
        ));
        c.begin_step().unwrap();
        assert!(matches!(
            c.begin_step(),
            Err(KgError::Controller(ControllerError::StepInProgress { step: 1 }))
        ));
        assert!(matches!(
            c.end_episode(),
            Err(KgError::Controller(ControllerError::StepInProgress { .. }))
        ));
    }

    #[test]
    fn mode_locked_for_episode() {
        let mut c = ModeController::new(engine_with(|_| {}));
        c.start_episode(ExecutionMode::DecoupledUpdateFirst).unwrap();
        assert!(matches!(
            c.start_episode(ExecutionMode::JointRetrieveUpdate),
            Err(KgError::Controller(ControllerError::ModeLocked { .. }))
        ));
        c.end_episode().unwrap();
        c.start_episode(ExecutionMode::JointRetrieveUpdate).unwrap();
    }

    #[test]
    fn update_first_visible_next_step() {
        let mut c = ModeController::new(engine_with(|_| {}));
        c.start_episode(ExecutionMode::DecoupledUpdateFirst).unwrap();
        c.begin_step().unwrap();
        let Submission::Queued(ticket) = c.submit(contains("kitchen", "fridge", 0.9)).unwrap()
        else {
            panic!("update-first must queue");
        };
        assert!(!sees(&mut c, "fridge"));
        let report = c.end_step().unwrap();
        assert!(report.flushed.is_empty());
        assert_eq!(report.pending, 1);

        let report = c.begin_step().unwrap();
        assert_eq!(report.flushed.len(), 1);
        let flushed = &report.flushed[0];
        assert_eq!(flushed.ticket, ticket);
        assert_eq!(flushed.submitted_step, 1);
        assert_eq!(flushed.applied_step, 2);
        assert_eq!(flushed.outcome.as_ref().unwrap().tag(), "accepted");
        assert!(sees(&mut c, "fridge"));
    }

    #[test]
    fn retrieve_first_applies_at_end_step() {
        let mut c = ModeController::new(engine_with(|_| {}));
        c.start_episode(ExecutionMode::DecoupledRetrieveFirst).unwrap();
        c.begin_step().unwrap();
        assert!(matches!(
            c.submit(contains("kitchen", "fridge", 0.9)).unwrap(),
            Submission::Queued(_)
        ));
        assert!(!sees(&mut c, "fridge"));
        let report = c.end_step().unwrap();
        assert_eq!(report.flushed.len(), 1);
        assert_eq!(report.flushed[0].applied_step, 1);

        c.begin_step().unwrap();
        assert!(sees(&mut c, "fridge"));
    }

    #[test]
    fn joint_update_overwrites_cached_copy() {
        let engine = engine_with(|_| {});
        engine.submit_evidence(&contains("kitchen", "fridge", 0.9)).unwrap();
        let mut c = ModeController::new(engine);
        c.start_episode(ExecutionMode::JointRetrieveUpdate).unwrap();
        c.begin_step().unwrap();

        let ranked = c.retrieve(&Query::keyword(&["fridge"])).unwrap();
        let key = ranked.top().unwrap().key();
        assert_eq!(c.memory().tier_of(&key), Some(Tier::Short));

        let Submission::Applied(outcome) = c.submit(contains("kitchen", "fridge", 0.5)).unwrap()
        else {
            panic!("joint mode applies immediately");
        };
        assert_eq!(outcome.tag(), "merged");
        let cached = c.memory_mut().lookup(&key).unwrap();
        assert!((cached.confidence - 0.7).abs() < 1e-6);
        assert_eq!(cached.evidence_count, 2);
    }

    #[test]
    fn memory_serves_repeat_queries() {
        let engine = engine_with(|config| config.retrieval.max_results = 1);
        engine.submit_evidence(&contains("kitchen", "fridge", 0.9)).unwrap();
        let mut c = ModeController::new(engine);
        c.start_default_episode().unwrap();
        c.begin_step().unwrap();
        let first = c.retrieve(&Query::keyword(&["fridge"])).unwrap();
        assert!(!first.from_memory);
        let second = c.retrieve(&Query::keyword(&["fridge"])).unwrap();
        assert!(second.from_memory);
        assert_eq!(second.top(), first.top());
    }

    #[test]
    fn memory_never_serves_facts_retired_elsewhere() {
        let engine = engine_with(|config| config.retrieval.max_results = 1);
        engine.submit_evidence(&contains("kitchen", "fridge", 0.9)).unwrap();
        let mut a = ModeController::new(Arc::clone(&engine));
        let mut b = ModeController::new(Arc::clone(&engine));
        for c in [&mut a, &mut b] {
            c.start_default_episode().unwrap();
            c.begin_step().unwrap();
        }
        let id = a
            .retrieve(&Query::keyword(&["fridge"]))
            .unwrap()
            .top()
            .unwrap()
            .edge_id;
        assert!(sees(&mut b, "fridge"));

        engine.graph().remove_edge_soft(id).unwrap();
        for c in [&mut a, &mut b] {
            let ranked = c.retrieve(&Query::keyword(&["fridge"])).unwrap();
            assert!(ranked.is_empty());
            assert!(!ranked.from_memory);
        }
        assert!(a.memory().is_empty());
    }

    #[test]
    fn throughput_guard_defers_excess() {
        let engine = engine_with(|config| config.controller.max_updates_per_window = 2);
        let mut c = ModeController::new(engine);
        c.start_episode(ExecutionMode::JointRetrieveUpdate).unwrap();
        c.begin_step().unwrap();
        let results: Vec<Submission> = ["fridge", "oven", "sink"]
            .iter()
            .map(|o| c.submit(contains("kitchen", o, 0.9)).unwrap())
            .collect();
        assert!(matches!(results[0], Submission::Applied(_)));
        assert!(matches!(results[1], Submission::Applied(_)));
        let Submission::Queued(ticket) = results[2] else {
            panic!("third update exceeds the window");
        };
        assert_eq!(c.end_step().unwrap().pending, 1);

        let report = c.begin_step().unwrap();
        assert_eq!(report.flushed.len(), 1);
        assert_eq!(report.flushed[0].ticket, ticket);
        assert_eq!(report.pending, 0);
    }

    #[test]
    fn end_episode_flushes_everything() {
        let engine = engine_with(|config| config.controller.max_updates_per_window = 1);
        let mut c = ModeController::new(Arc::clone(&engine));
        c.start_episode(ExecutionMode::DecoupledUpdateFirst).unwrap();
        c.begin_step().unwrap();
        for o in ["fridge", "oven", "sink"] {
            c.submit(contains("kitchen", o, 0.9)).unwrap();
        }
        c.end_step().unwrap();
        let report = c.end_episode().unwrap();
        assert_eq!(report.flushed.len(), 3);
        assert_eq!(report.steps, 1);
        assert_eq!(c.pending_len(), 0);
        assert_eq!(engine.graph().edge_count(), 3);
        assert_eq!(c.mode(), None);
    }

    #[test]
    fn scheduled_decay_refreshes_memory() {
        let engine = engine_with(|config| {
            config.controller.decay_every_steps = Some(2);
            config.update.decay_factor = 0.5;
            config.update.soft_retire_floor = 0.3;
        });
        engine.submit_evidence(&contains("kitchen", "fridge", 0.9)).unwrap();
        let mut c = ModeController::new(engine);
        c.start_default_episode().unwrap();

        c.begin_step().unwrap();
        let key = c
            .retrieve(&Query::keyword(&["fridge"]))
            .unwrap()
            .top()
            .unwrap()
            .key();
        assert!(c.end_step().unwrap().decay.is_none());

        // 0.9 -> 0.45 -> 0.225: retired on the second sweep
        c.begin_step().unwrap();
        let report = c.end_step().unwrap();
        assert_eq!(report.decay.unwrap().decayed, 1);
        assert!(c.memory().tier_of(&key).is_some());

        c.begin_step().unwrap();
        c.end_step().unwrap();
        c.begin_step().unwrap();
        let report = c.end_step().unwrap();
        assert_eq!(report.decay.unwrap().retired.len(), 1);
        assert_eq!(c.memory().tier_of(&key), None);
    }

    fn observe<C: RetrieverClient + UpdaterClient>(client: &mut C) -> usize {
        client.submit(contains("hallway", "lamp", 0.8)).unwrap();
        client.retrieve(&Query::keyword(&["lamp"])).unwrap().len()
    }

    #[test]
    fn clients_are_interchangeable() {
        let engine = engine_with(|_| {});
        let mut direct: &Engine = &engine;
        assert_eq!(observe(&mut direct), 1);

        let mut c = ModeController::new(engine_with(|_| {}));
        c.start_episode(ExecutionMode::JointRetrieveUpdate).unwrap();
        c.begin_step().unwrap();
        assert_eq!(observe(&mut c), 1);
    }
}
