//! Participant presence and identity registry.
//!
//! Tracks who is currently connected, hands each participant a unique
//! display name from a fixed pool, and supports reconnection with a
//! client-held persistent id. Disconnection does not release the identity
//! immediately: a grace timer keeps the record alive so a brief network
//! drop does not cost the participant their name.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};
use uuid::Uuid;

use super::timer::{Scheduler, TimerHandle, TimerTask};

/// Grace period before a disconnected participant's identity is released.
pub const DISCONNECT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Display name pool. Its size bounds concurrent participants.
pub const NAME_POOL: [&str; 30] = [
    "Tiger", "Lion", "Elephant", "Bear", "Deer", "Horse", "Ox", "Buffalo", "Rooster", "Duck",
    "Dog", "Cat", "Rabbit", "Mouse", "Monkey", "Pig", "Goat", "Sheep", "Squirrel", "Weasel",
    "Fox", "Sparrow", "Eagle", "Seagull", "Owl", "Butterfly", "Bee", "Ant", "Snake", "Turtle",
];

/// Maximum concurrent participants (one per pool name).
pub const MAX_PARTICIPANTS: usize = NAME_POOL.len();

/// A registered participant.
#[derive(Debug, Clone)]
pub struct Participant {
    /// Current transport session id. Changes on reconnect.
    pub connection_id: String,

    /// Stable client-held id. Survives reconnection.
    pub persistent_id: String,

    /// Display name drawn from [`NAME_POOL`], unique while registered.
    pub display_name: String,

    /// When this participant first joined.
    pub joined_at: chrono::DateTime<chrono::Utc>,

    /// Last connect or disconnect activity.
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// Registration rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The name pool is exhausted.
    Full,

    /// The persistent id already has a live connection (second tab).
    DuplicateActive,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "Room is full ({}/{})", MAX_PARTICIPANTS, MAX_PARTICIPANTS),
            Self::DuplicateActive => {
                write!(f, "Already connected from another session")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Presence registry - tracks all registered participants.
#[derive(Debug)]
pub struct PresenceRegistry {
    /// Participants by persistent id (live or within grace).
    participants: HashMap<String, Participant>,

    /// Live connection id to persistent id mapping.
    active: HashMap<String, String>,

    /// Names not currently assigned.
    available_names: Vec<String>,

    /// Pending grace timers keyed by persistent id.
    grace_timers: HashMap<String, TimerHandle>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            participants: HashMap::new(),
            active: HashMap::new(),
            available_names: NAME_POOL.iter().map(|n| n.to_string()).collect(),
            grace_timers: HashMap::new(),
        }
    }

    /// Register a connection.
    ///
    /// A known-but-inactive persistent id is reattached to the new
    /// connection and its pending grace timer cancelled. A known-and-active
    /// persistent id is rejected so two tabs never share one identity. An
    /// unknown (or absent) persistent id gets a fresh identity from the
    /// pool; the server generates a persistent id if the client supplied
    /// none.
    pub fn register(
        &mut self,
        connection_id: &str,
        persistent_id: Option<&str>,
        sched: &mut dyn Scheduler,
    ) -> Result<Participant, RegistryError> {
        if let Some(pid) = persistent_id {
            let known = self.participants.get(pid).map(|p| p.connection_id.clone());
            if let Some(old_connection) = known {
                if self.active.contains_key(&old_connection) {
                    debug!(persistent_id = %pid, "registration rejected: duplicate connection");
                    return Err(RegistryError::DuplicateActive);
                }

                // Reattach before the grace timer fires. Cancelling an
                // already-fired handle is a no-op.
                if let Some(handle) = self.grace_timers.remove(pid) {
                    sched.cancel(handle);
                }

                if let Some(participant) = self.participants.get_mut(pid) {
                    participant.connection_id = connection_id.to_string();
                    participant.last_seen = chrono::Utc::now();
                    self.active
                        .insert(connection_id.to_string(), pid.to_string());
                    info!(name = %participant.display_name, persistent_id = %pid, "participant reconnected");
                    return Ok(participant.clone());
                }
            }
        }

        let Some(display_name) = self.draw_name() else {
            debug!("registration rejected: name pool exhausted");
            return Err(RegistryError::Full);
        };

        let persistent_id = persistent_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = chrono::Utc::now();
        let participant = Participant {
            connection_id: connection_id.to_string(),
            persistent_id: persistent_id.clone(),
            display_name,
            joined_at: now,
            last_seen: now,
        };

        self.active
            .insert(connection_id.to_string(), persistent_id.clone());
        self.participants.insert(persistent_id, participant.clone());

        info!(name = %participant.display_name, "participant joined");
        Ok(participant)
    }

    /// Mark a connection inactive and schedule identity release after the
    /// grace period. Returns the affected participant, or `None` for an
    /// unknown connection.
    pub fn deactivate(
        &mut self,
        connection_id: &str,
        sched: &mut dyn Scheduler,
    ) -> Option<Participant> {
        let pid = self.active.remove(connection_id)?;
        let Some(participant) = self.participants.get_mut(&pid) else {
            debug_assert!(false, "active index points at missing participant {pid}");
            return None;
        };

        participant.last_seen = chrono::Utc::now();
        let handle = sched.schedule_after(
            DISCONNECT_GRACE_PERIOD,
            TimerTask::GraceExpiry {
                persistent_id: pid.clone(),
            },
        );
        self.grace_timers.insert(pid, handle);

        info!(name = %participant.display_name, "participant disconnected, grace period started");
        Some(participant.clone())
    }

    /// Release a participant's identity after the grace period elapsed.
    /// A no-op if the participant reattached first: reattachment takes the
    /// timer entry with it, so even a stray late delivery removes nothing.
    pub fn grace_expired(&mut self, persistent_id: &str) -> Option<Participant> {
        self.grace_timers.remove(persistent_id)?;
        let participant = self.participants.remove(persistent_id)?;
        debug_assert!(
            !self.active.contains_key(&participant.connection_id),
            "grace expiry for an active participant {persistent_id}"
        );

        self.available_names.push(participant.display_name.clone());
        info!(name = %participant.display_name, "participant removed, name returned to pool");
        Some(participant)
    }

    /// Get the participant behind a live connection.
    pub fn lookup_by_connection(&self, connection_id: &str) -> Option<&Participant> {
        let pid = self.active.get(connection_id)?;
        self.participants.get(pid)
    }

    /// Get a participant (live or within grace) by persistent id.
    pub fn lookup_by_persistent_id(&self, persistent_id: &str) -> Option<&Participant> {
        self.participants.get(persistent_id)
    }

    /// Whether the persistent id currently has a live connection.
    pub fn is_active(&self, persistent_id: &str) -> bool {
        self.participants
            .get(persistent_id)
            .map(|p| self.active.contains_key(&p.connection_id))
            .unwrap_or(false)
    }

    /// Count of live connections.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Currently connected participants, oldest join first.
    pub fn active_snapshot(&self) -> Vec<&Participant> {
        let mut participants: Vec<&Participant> = self
            .active
            .values()
            .filter_map(|pid| self.participants.get(pid))
            .collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        participants
    }

    /// Roster payload broadcast after every registration or deactivation.
    pub fn roster_snapshot(&self) -> serde_json::Value {
        let players: Vec<serde_json::Value> = self
            .active_snapshot()
            .iter()
            .map(|p| {
                serde_json::json!({
                    "persistent_id": p.persistent_id,
                    "display_name": p.display_name,
                })
            })
            .collect();

        serde_json::json!({
            "player_count": self.active.len(),
            "players": players,
        })
    }

    /// Payload for a client that just registered: its own identity plus
    /// the current roster.
    pub fn welcome_snapshot(&self, participant: &Participant) -> serde_json::Value {
        let roster = self.roster_snapshot();
        serde_json::json!({
            "persistent_id": participant.persistent_id,
            "display_name": participant.display_name,
            "player_count": roster["player_count"],
            "players": roster["players"],
        })
    }

    /// Uniform-random draw from the unused names.
    fn draw_name(&mut self) -> Option<String> {
        if self.available_names.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.available_names.len());
        Some(self.available_names.swap_remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::timer::VirtualScheduler;
    use std::collections::HashSet;

    fn register_fresh(
        registry: &mut PresenceRegistry,
        sched: &mut VirtualScheduler,
        n: usize,
    ) -> Vec<Participant> {
        (0..n)
            .map(|i| {
                registry
                    .register(&format!("conn-{i}"), None, sched)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_pool_bounds_party_size() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        register_fresh(&mut registry, &mut sched, MAX_PARTICIPANTS);
        assert_eq!(registry.active_count(), MAX_PARTICIPANTS);

        // The 31st distinct registration is rejected
        let result = registry.register("conn-extra", None, &mut sched);
        assert_eq!(result.unwrap_err(), RegistryError::Full);
        assert_eq!(registry.active_count(), MAX_PARTICIPANTS);
    }

    #[test]
    fn test_names_are_unique() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        let participants = register_fresh(&mut registry, &mut sched, MAX_PARTICIPANTS);
        let names: HashSet<&str> = participants.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names.len(), MAX_PARTICIPANTS);
    }

    #[test]
    fn test_generates_persistent_id_when_absent() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        let generated = registry.register("conn-1", None, &mut sched).unwrap();
        assert!(!generated.persistent_id.is_empty());

        let supplied = registry
            .register("conn-2", Some("client-held-id"), &mut sched)
            .unwrap();
        assert_eq!(supplied.persistent_id, "client-held-id");
    }

    #[test]
    fn test_reattach_restores_identity() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        let original = registry.register("conn-1", None, &mut sched).unwrap();
        registry.deactivate("conn-1", &mut sched);
        assert_eq!(registry.active_count(), 0);

        let restored = registry
            .register("conn-2", Some(&original.persistent_id), &mut sched)
            .unwrap();
        assert_eq!(restored.display_name, original.display_name);
        assert_eq!(restored.connection_id, "conn-2");
        assert_eq!(registry.active_count(), 1);

        // Reattachment cancelled the grace timer
        let fired = sched.advance(DISCONNECT_GRACE_PERIOD);
        assert!(fired.is_empty());
        assert!(registry
            .lookup_by_persistent_id(&original.persistent_id)
            .is_some());
    }

    #[test]
    fn test_duplicate_active_rejected() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        let participant = registry.register("conn-1", None, &mut sched).unwrap();
        let result = registry.register("conn-2", Some(&participant.persistent_id), &mut sched);

        assert_eq!(result.unwrap_err(), RegistryError::DuplicateActive);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.lookup_by_connection("conn-2").is_none());
        // First connection untouched
        assert_eq!(
            registry.lookup_by_connection("conn-1").unwrap().persistent_id,
            participant.persistent_id
        );
    }

    #[test]
    fn test_grace_expiry_returns_name_to_pool() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        let participant = registry.register("conn-1", None, &mut sched).unwrap();
        registry.deactivate("conn-1", &mut sched);

        let fired = sched.advance(DISCONNECT_GRACE_PERIOD);
        assert_eq!(fired.len(), 1);
        match &fired[0] {
            TimerTask::GraceExpiry { persistent_id } => {
                registry.grace_expired(persistent_id);
            }
            task => panic!("unexpected task {task:?}"),
        }

        assert!(registry
            .lookup_by_persistent_id(&participant.persistent_id)
            .is_none());

        // Name is reusable: a full house fits again
        register_fresh(&mut registry, &mut sched, MAX_PARTICIPANTS);
        assert_eq!(registry.active_count(), MAX_PARTICIPANTS);
    }

    #[test]
    fn test_grace_expiry_after_reattach_is_noop() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        let participant = registry.register("conn-1", None, &mut sched).unwrap();
        registry.deactivate("conn-1", &mut sched);
        registry
            .register("conn-2", Some(&participant.persistent_id), &mut sched)
            .unwrap();

        // Even a stray delivery must not evict the reattached participant
        registry.grace_expired(&participant.persistent_id);
        assert!(registry.is_active(&participant.persistent_id));
    }

    #[test]
    fn test_lookups() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        let participant = registry.register("conn-1", None, &mut sched).unwrap();

        assert_eq!(
            registry
                .lookup_by_connection("conn-1")
                .unwrap()
                .persistent_id,
            participant.persistent_id
        );
        assert!(registry.lookup_by_connection("conn-unknown").is_none());
        assert!(registry
            .lookup_by_persistent_id(&participant.persistent_id)
            .is_some());
        assert!(registry.is_active(&participant.persistent_id));

        registry.deactivate("conn-1", &mut sched);
        assert!(registry.lookup_by_connection("conn-1").is_none());
        // Record survives within grace
        assert!(registry
            .lookup_by_persistent_id(&participant.persistent_id)
            .is_some());
        assert!(!registry.is_active(&participant.persistent_id));
    }

    #[test]
    fn test_roster_snapshot() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        register_fresh(&mut registry, &mut sched, 3);
        registry.deactivate("conn-1", &mut sched);

        let roster = registry.roster_snapshot();
        assert_eq!(roster["player_count"], 2);
        assert_eq!(roster["players"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_welcome_snapshot() {
        let mut registry = PresenceRegistry::new();
        let mut sched = VirtualScheduler::new();

        let participant = registry.register("conn-1", None, &mut sched).unwrap();
        let welcome = registry.welcome_snapshot(&participant);

        assert_eq!(welcome["persistent_id"], participant.persistent_id.as_str());
        assert_eq!(welcome["display_name"], participant.display_name.as_str());
        assert_eq!(welcome["player_count"], 1);
    }
}
