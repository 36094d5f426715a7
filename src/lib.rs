//! Parlor State Library
//!
//! This crate provides the core state for Parlor, a small party game in
//! which one player proposes a round, the group votes it in, and everyone
//! else answers against a countdown.
//!
//! # Overview
//!
//! The state module provides:
//!
//! - **Presence Registry** - Tracks connected participants, assigns each a
//!   unique display name from a fixed pool, and tolerates brief network
//!   drops with a reconnection grace period.
//!
//! - **Round State Machine** - Drives the single global round through
//!   `Idle -> Voting -> Answering -> Results -> Idle`, with countdown
//!   timeouts and a quorum early-exit.
//!
//! - **Scheduler capability** - Countdowns and grace periods are tasks
//!   handed to an injected scheduler, so tests run on a virtual clock.
//!
//! # Design Principles
//!
//! 1. **Rejections are values** - Invalid commands return typed rejection
//!    reasons and change nothing; nothing inside the core panics.
//!
//! 2. **Snapshots, not sockets** - The core produces JSON snapshots; the
//!    transport layer owns all fan-out.
//!
//! 3. **No networking** - This crate is pure state, no WebSocket or HTTP.
//!
//! 4. **No hidden time** - Every timed behavior flows through the
//!    injected scheduler and back in through `handle_timer`.
//!
//! # Example
//!
//! ```rust
//! use parlor_state::state::{Answer, GameContext, Phase, VirtualScheduler};
//!
//! let mut ctx = GameContext::new();
//! let mut sched = VirtualScheduler::new();
//!
//! // Two players join
//! let alice = ctx.registry.register("conn-1", None, &mut sched).unwrap();
//! let bob = ctx.registry.register("conn-2", None, &mut sched).unwrap();
//!
//! // Alice proposes a round; Bob's vote meets quorum (ceil(2/2) = 1)
//! let party_size = ctx.registry.active_count();
//! ctx.machine.propose(&alice, party_size, &mut sched).unwrap();
//! ctx.machine.cast_vote(&bob, true, &mut sched).unwrap();
//! assert_eq!(ctx.machine.phase(), Phase::Answering);
//!
//! // Bob answers; Alice, as proposer, may not
//! ctx.machine.submit_answer(&bob.persistent_id, Answer::Partial).unwrap();
//! assert!(ctx.machine.submit_answer(&alice.persistent_id, Answer::Unknown).is_err());
//! ```

pub mod state;

// Re-export everything from state module at crate root
pub use state::*;
