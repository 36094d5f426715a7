//! Round state machine.
//!
//! Owns the single process-wide game phase and drives it through
//! `Idle -> Voting -> Answering -> Results -> Idle`. Phase countdowns and
//! the quorum early-exit are the only transitions; everything else is a
//! typed rejection that leaves state untouched.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::presence::Participant;
use super::timer::{Scheduler, TimerHandle, TimerTask};

/// Ticks in each phase countdown.
pub const COUNTDOWN_TICKS: u8 = 10;

/// Length of one countdown tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Game phase. Exactly one is active at any time, process-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No round in flight
    #[default]
    Idle,
    /// A proposal is being voted on
    Voting,
    /// Approved round collecting answers
    Answering,
    /// Outcome on display before reset
    Results,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Voting => "voting",
            Self::Answering => "answering",
            Self::Results => "results",
        }
    }
}

/// Answer domain. `Unknown` is the fail-safe default; a single `Partial`
/// flips the round outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Answer {
    Unknown,
    Partial,
}

impl Answer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Partial => "partial",
        }
    }
}

/// Frozen result of a round, computed exactly once when answering ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub result: Answer,
    pub partial_count: usize,
    /// Explicit "unknown" answers plus non-responders.
    pub unknown_count: usize,
}

/// A round in flight. Exists exactly while the phase is not [`Phase::Idle`].
#[derive(Debug, Clone)]
pub struct Round {
    pub proposer_name: String,
    pub proposer_connection_id: String,
    pub proposer_persistent_id: String,

    /// Party size at proposal time. All thresholds derive from this
    /// frozen value, not from the live roster.
    pub quorum_base: usize,

    /// Persistent ids whose latest choice is yes.
    approvals: HashSet<String>,

    /// Persistent ids that cast any vote.
    voters: HashSet<String>,

    /// Persistent id to latest choice.
    vote_choices: HashMap<String, bool>,

    /// Persistent id to answer. Never contains the proposer.
    answers: HashMap<String, Answer>,

    /// When the round was proposed.
    pub proposed_at: chrono::DateTime<chrono::Utc>,

    /// When the answering phase began.
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,

    /// When the answering phase ended.
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,

    outcome: Option<RoundOutcome>,
}

impl Round {
    fn new(proposer: &Participant, quorum_base: usize) -> Self {
        Self {
            proposer_name: proposer.display_name.clone(),
            proposer_connection_id: proposer.connection_id.clone(),
            proposer_persistent_id: proposer.persistent_id.clone(),
            quorum_base,
            approvals: HashSet::new(),
            voters: HashSet::new(),
            vote_choices: HashMap::new(),
            answers: HashMap::new(),
            proposed_at: chrono::Utc::now(),
            started_at: None,
            ended_at: None,
            outcome: None,
        }
    }

    /// Approvals needed to start the answering phase.
    pub fn quorum(&self) -> usize {
        self.quorum_base.div_ceil(2)
    }

    /// Eligible answerers: everyone counted at proposal time except the
    /// proposer.
    pub fn answer_pool(&self) -> usize {
        self.quorum_base.saturating_sub(1)
    }

    pub fn approval_count(&self) -> usize {
        self.approvals.len()
    }

    pub fn has_voted(&self, persistent_id: &str) -> bool {
        self.voters.contains(persistent_id)
    }

    pub fn vote_of(&self, persistent_id: &str) -> Option<bool> {
        self.vote_choices.get(persistent_id).copied()
    }

    pub fn answer_count(&self) -> usize {
        self.answers.len()
    }

    pub fn has_answered(&self, persistent_id: &str) -> bool {
        self.answers.contains_key(persistent_id)
    }

    pub fn answer_of(&self, persistent_id: &str) -> Option<Answer> {
        self.answers.get(persistent_id).copied()
    }

    /// Frozen outcome, present from the Results phase on.
    pub fn outcome(&self) -> Option<&RoundOutcome> {
        self.outcome.as_ref()
    }

    /// Record a vote. The latest choice wins; `approvals` never
    /// double-counts a voter.
    fn record_vote(&mut self, persistent_id: &str, approve: bool) {
        self.voters.insert(persistent_id.to_string());
        self.vote_choices.insert(persistent_id.to_string(), approve);
        if approve {
            self.approvals.insert(persistent_id.to_string());
        } else {
            self.approvals.remove(persistent_id);
        }
    }

    fn compute_outcome(&self) -> RoundOutcome {
        let partial_count = self
            .answers
            .values()
            .filter(|a| **a == Answer::Partial)
            .count();
        let explicit_unknown = self
            .answers
            .values()
            .filter(|a| **a == Answer::Unknown)
            .count();

        // Non-responders count as "unknown" so silence is never a
        // positive signal.
        let unanswered = self.answer_pool().saturating_sub(self.answers.len());

        let result = if partial_count >= 1 {
            Answer::Partial
        } else {
            Answer::Unknown
        };

        RoundOutcome {
            result,
            partial_count,
            unknown_count: explicit_unknown + unanswered,
        }
    }
}

/// Rejection reasons. Every rejected operation is a pure no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundError {
    /// `propose` outside the idle phase.
    NotIdle,
    /// A vote or answer outside its phase.
    WrongPhase,
    /// The proposer tried to answer their own round.
    IsProposer,
    /// A second answer from the same participant.
    AlreadyAnswered,
}

impl std::fmt::Display for RoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotIdle => write!(f, "A round is already in progress"),
            Self::WrongPhase => write!(f, "Not accepting that right now"),
            Self::IsProposer => write!(f, "The proposer cannot answer their own round"),
            Self::AlreadyAnswered => write!(f, "Answer already recorded"),
        }
    }
}

impl std::error::Error for RoundError {}

/// The round state machine.
///
/// | Phase     | Timeout target        | Early exit                     |
/// |-----------|-----------------------|--------------------------------|
/// | Voting    | Idle (round discarded)| quorum reached -> Answering    |
/// | Answering | Results (outcome)     | none                           |
/// | Results   | Idle (round discarded)| none                           |
#[derive(Debug, Default)]
pub struct RoundMachine {
    phase: Phase,
    round: Option<Round>,

    /// Seconds left in the current phase, 0 when idle.
    countdown: u8,

    /// Handle of the armed countdown tick, if any. At most one exists.
    tick_timer: Option<TimerHandle>,
}

impl RoundMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn countdown(&self) -> u8 {
        self.countdown
    }

    pub fn round(&self) -> Option<&Round> {
        self.round.as_ref()
    }

    /// Propose a new round. Valid only while idle. `active_count` is the
    /// live party size, frozen into the round as its quorum base.
    pub fn propose(
        &mut self,
        proposer: &Participant,
        active_count: usize,
        sched: &mut dyn Scheduler,
    ) -> Result<(), RoundError> {
        if self.phase != Phase::Idle {
            debug!(phase = self.phase.as_str(), "proposal rejected: round already in progress");
            return Err(RoundError::NotIdle);
        }
        debug_assert!(self.round.is_none(), "idle phase with a live round");
        debug_assert!(active_count > 0, "proposer not counted in party size");

        self.round = Some(Round::new(proposer, active_count));
        self.phase = Phase::Voting;
        self.start_countdown(sched);

        info!(proposer = %proposer.display_name, quorum_base = active_count, "round proposed");
        Ok(())
    }

    /// Record a vote. Recasting replaces the previous choice. Reaching
    /// quorum ends voting immediately, regardless of remaining time.
    pub fn cast_vote(
        &mut self,
        voter: &Participant,
        approve: bool,
        sched: &mut dyn Scheduler,
    ) -> Result<(), RoundError> {
        if self.phase != Phase::Voting {
            debug!(phase = self.phase.as_str(), "vote rejected: not voting");
            return Err(RoundError::WrongPhase);
        }
        let Some(round) = self.round.as_mut() else {
            debug_assert!(false, "voting phase with no round");
            return Err(RoundError::WrongPhase);
        };

        round.record_vote(&voter.persistent_id, approve);
        debug!(
            voter = %voter.display_name,
            approve,
            approvals = round.approval_count(),
            quorum = round.quorum(),
            "vote recorded"
        );

        if round.approval_count() >= round.quorum() {
            self.begin_answering(sched);
        }
        Ok(())
    }

    /// Record an answer. The proposer may never answer their own round;
    /// double submissions are rejected, not overwritten.
    pub fn submit_answer(&mut self, persistent_id: &str, answer: Answer) -> Result<(), RoundError> {
        if self.phase != Phase::Answering {
            debug!(phase = self.phase.as_str(), "answer rejected: not answering");
            return Err(RoundError::WrongPhase);
        }
        let Some(round) = self.round.as_mut() else {
            debug_assert!(false, "answering phase with no round");
            return Err(RoundError::WrongPhase);
        };

        if persistent_id == round.proposer_persistent_id {
            debug!("answer rejected: proposer cannot answer their own round");
            return Err(RoundError::IsProposer);
        }
        if round.answers.contains_key(persistent_id) {
            debug!(persistent_id = %persistent_id, "answer rejected: already answered");
            return Err(RoundError::AlreadyAnswered);
        }

        round.answers.insert(persistent_id.to_string(), answer);
        debug!(answer = answer.as_str(), total = round.answer_count(), "answer recorded");
        Ok(())
    }

    /// Deliver one countdown tick. The driver calls this when the
    /// scheduler fires [`TimerTask::RoundTick`].
    pub fn countdown_tick(&mut self, sched: &mut dyn Scheduler) {
        if self.phase == Phase::Idle {
            // A tick that raced the return to idle; nothing to do.
            return;
        }

        self.tick_timer = None;
        self.countdown = self.countdown.saturating_sub(1);

        if self.countdown > 0 {
            self.tick_timer = Some(sched.schedule_after(TICK_INTERVAL, TimerTask::RoundTick));
            return;
        }

        match self.phase {
            Phase::Voting => self.return_to_idle(sched, "voting timed out short of quorum"),
            Phase::Answering => self.begin_results(sched),
            Phase::Results => self.return_to_idle(sched, "results window closed"),
            Phase::Idle => {}
        }
    }

    /// Broadcast snapshot of the current phase.
    pub fn state_snapshot(&self) -> serde_json::Value {
        match (self.phase, self.round.as_ref()) {
            (Phase::Voting, Some(round)) => serde_json::json!({
                "phase": Phase::Voting.as_str(),
                "proposer_name": round.proposer_name,
                "vote_count": round.approval_count(),
                "quorum_base": round.quorum_base,
                "countdown": self.countdown,
            }),
            (Phase::Answering, Some(round)) => serde_json::json!({
                "phase": Phase::Answering.as_str(),
                "proposer_name": round.proposer_name,
                "answer_count": round.answer_count(),
                "total_answerers": round.answer_pool(),
                "countdown": self.countdown,
            }),
            (Phase::Results, Some(round)) => self.results_snapshot(round),
            (phase, round) => {
                debug_assert!(
                    phase == Phase::Idle && round.is_none(),
                    "phase {} with round present: {}",
                    phase.as_str(),
                    round.is_some()
                );
                serde_json::json!({ "phase": Phase::Idle.as_str() })
            }
        }
    }

    /// Per-recipient snapshot. Voting adds the recipient's recorded vote;
    /// answering adds proposer and answer status. Idle and results
    /// payloads are identical for every recipient.
    pub fn personalized_snapshot(&self, participant: &Participant) -> serde_json::Value {
        let mut snapshot = self.state_snapshot();
        let Some(round) = self.round.as_ref() else {
            return snapshot;
        };

        match self.phase {
            Phase::Voting => {
                snapshot["has_voted"] =
                    serde_json::json!(round.has_voted(&participant.persistent_id));
                if let Some(choice) = round.vote_of(&participant.persistent_id) {
                    snapshot["user_vote"] = serde_json::json!(choice);
                }
            }
            Phase::Answering => {
                snapshot["is_proposer"] = serde_json::json!(
                    participant.persistent_id == round.proposer_persistent_id
                );
                snapshot["has_answered"] =
                    serde_json::json!(round.has_answered(&participant.persistent_id));
                if let Some(answer) = round.answer_of(&participant.persistent_id) {
                    snapshot["answer"] = serde_json::json!(answer);
                }
            }
            Phase::Idle | Phase::Results => {}
        }
        snapshot
    }

    /// The only early-exit transition: quorum reached during voting.
    fn begin_answering(&mut self, sched: &mut dyn Scheduler) {
        if let Some(round) = self.round.as_mut() {
            round.started_at = Some(chrono::Utc::now());
        }
        self.phase = Phase::Answering;
        // Cancels the in-flight voting countdown before arming the next.
        self.start_countdown(sched);
        info!("quorum reached, answering phase started");
    }

    fn begin_results(&mut self, sched: &mut dyn Scheduler) {
        let Some(round) = self.round.as_mut() else {
            debug_assert!(false, "answering timeout with no round");
            self.return_to_idle(sched, "round missing at answering timeout");
            return;
        };

        round.ended_at = Some(chrono::Utc::now());
        let outcome = round.compute_outcome();
        info!(
            result = outcome.result.as_str(),
            partial = outcome.partial_count,
            unknown = outcome.unknown_count,
            "round outcome computed"
        );
        round.outcome = Some(outcome);

        self.phase = Phase::Results;
        self.start_countdown(sched);
    }

    fn return_to_idle(&mut self, sched: &mut dyn Scheduler, reason: &str) {
        self.cancel_countdown(sched);
        self.phase = Phase::Idle;
        self.round = None;
        self.countdown = 0;
        info!(reason, "round cleared, returning to idle");
    }

    /// Arm a fresh phase countdown, cancelling any previous one first so
    /// the machine never has two countdowns in flight.
    fn start_countdown(&mut self, sched: &mut dyn Scheduler) {
        self.cancel_countdown(sched);
        self.countdown = COUNTDOWN_TICKS;
        self.tick_timer = Some(sched.schedule_after(TICK_INTERVAL, TimerTask::RoundTick));
    }

    fn cancel_countdown(&mut self, sched: &mut dyn Scheduler) {
        if let Some(handle) = self.tick_timer.take() {
            sched.cancel(handle);
        }
    }

    fn results_snapshot(&self, round: &Round) -> serde_json::Value {
        // Always read the outcome frozen at the end of answering;
        // recomputing here could disagree with what was announced.
        let Some(outcome) = round.outcome() else {
            debug_assert!(false, "results phase without a frozen outcome");
            return serde_json::json!({ "phase": Phase::Results.as_str() });
        };

        serde_json::json!({
            "phase": Phase::Results.as_str(),
            "result": outcome.result,
            "counts": {
                "partial": outcome.partial_count,
                "unknown": outcome.unknown_count,
            },
            "countdown": self.countdown,
        })
    }
}
