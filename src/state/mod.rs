//! State management module for Parlor.
//!
//! This module provides the core state types:
//!
//! - `presence` - Participant registry, name pool, reconnection grace
//! - `round` - Round state machine and phase countdowns
//! - `timer` - Injected scheduler capability
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        GameContext                           │
//! │                                                              │
//! │  ┌──────────────────┐ active_count ┌─────────────────────┐   │
//! │  │ PresenceRegistry │─────────────▶│    RoundMachine     │   │
//! │  │                  │              │                     │   │
//! │  │ connection_id →  │              │ Idle → Voting →     │   │
//! │  │   persistent_id  │              │ Answering → Results │   │
//! │  │ persistent_id →  │              │   → Idle            │   │
//! │  │   Participant    │              │                     │   │
//! │  └────────┬─────────┘              └──────────┬──────────┘   │
//! │           │ GraceExpiry                       │ RoundTick    │
//! │           ▼                                   ▼              │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │              Scheduler (injected)                    │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport layer owns a `GameContext`, forwards client commands
//! into it, relays its snapshots back out, and feeds fired timer tasks
//! through [`GameContext::handle_timer`]. The core itself never touches
//! the network.

pub mod presence;
pub mod round;
pub mod timer;

// Re-export commonly used types
pub use presence::{
    Participant, PresenceRegistry, RegistryError, DISCONNECT_GRACE_PERIOD, MAX_PARTICIPANTS,
    NAME_POOL,
};
pub use round::{
    Answer, Phase, Round, RoundError, RoundMachine, RoundOutcome, COUNTDOWN_TICKS, TICK_INTERVAL,
};
pub use timer::{Scheduler, TimerHandle, TimerTask, VirtualScheduler};

/// Combined game state: one registry, one round machine.
///
/// The explicit context object the transport entry point owns and passes
/// into every operation. No hidden statics, so the whole core can be
/// instantiated per test.
#[derive(Debug, Default)]
pub struct GameContext {
    pub registry: PresenceRegistry,
    pub machine: RoundMachine,
}

impl GameContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch a fired timer task to its owner.
    ///
    /// The driver must call this from the same serialization domain as
    /// the command handlers; a tick and a vote both mutate the round.
    pub fn handle_timer(&mut self, task: TimerTask, sched: &mut dyn Scheduler) {
        match task {
            TimerTask::RoundTick => self.machine.countdown_tick(sched),
            TimerTask::GraceExpiry { persistent_id } => {
                self.registry.grace_expired(&persistent_id);
            }
        }
    }

    /// Personalized phase snapshot for a (re)connecting client, or `None`
    /// for an unknown connection.
    pub fn sync_snapshot(&self, connection_id: &str) -> Option<serde_json::Value> {
        let participant = self.registry.lookup_by_connection(connection_id)?;
        Some(self.machine.personalized_snapshot(participant))
    }
}
