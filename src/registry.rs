//! Session registry
//!
//! The process-wide set of currently logged-in usernames, capped at
//! [`MAX_SESSIONS`]. One user owns at most one slot at any moment;
//! uniqueness is checked by a linear scan under the lock, so
//! `try_add`/`remove` are linearisable.
//!
//! Lock acquisition is bounded: a handful of timed attempts, after which
//! the registry is considered wedged. That is an internal invariant
//! violation (no session-level recovery exists for it) and terminates
//! the process.

use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{error, warn};

/// Maximum concurrently active sessions, and the listen backlog.
pub const MAX_SESSIONS: usize = 10;

/// Timed attempts made to acquire the registry lock.
const MAX_ACQUIRE_RETRIES: u32 = 3;

/// Patience per acquisition attempt.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of [`SessionRegistry::try_add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The username now owns this slot index.
    Added(usize),
    /// Another live session already owns this username.
    AlreadyLoggedIn,
    /// Every slot is occupied.
    Full,
}

/// Fixed-capacity set of logged-in usernames.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    slots: Mutex<[Option<String>; MAX_SESSIONS]>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_bounded(&self) -> MutexGuard<'_, [Option<String>; MAX_SESSIONS]> {
        for attempt in 1..=MAX_ACQUIRE_RETRIES {
            match timeout(ACQUIRE_TIMEOUT, self.slots.lock()).await {
                Ok(guard) => return guard,
                Err(_) => warn!(
                    "session registry lock attempt {attempt}/{MAX_ACQUIRE_RETRIES} timed out"
                ),
            }
        }
        error!("session registry lock unacquirable, terminating");
        std::process::exit(1);
    }

    /// Claim the lowest free slot for `username`.
    pub async fn try_add(&self, username: &str) -> AddOutcome {
        let mut slots = self.lock_bounded().await;

        if slots
            .iter()
            .flatten()
            .any(|occupant| occupant == username)
        {
            return AddOutcome::AlreadyLoggedIn;
        }

        match slots.iter().position(Option::is_none) {
            Some(index) => {
                slots[index] = Some(username.to_string());
                AddOutcome::Added(index)
            }
            None => AddOutcome::Full,
        }
    }

    /// Release a slot claimed by [`Self::try_add`].
    pub async fn remove(&self, slot: usize) {
        let mut slots = self.lock_bounded().await;
        slots[slot] = None;
    }

    /// How many usernames are currently logged in.
    pub async fn logged_in(&self) -> usize {
        let slots = self.lock_bounded().await;
        slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_usernames_are_refused() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.try_add("alice").await, AddOutcome::Added(0));
        assert_eq!(registry.try_add("alice").await, AddOutcome::AlreadyLoggedIn);
        assert_eq!(registry.try_add("bob").await, AddOutcome::Added(1));
    }

    #[tokio::test]
    async fn removed_slot_is_reused_lowest_first() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.try_add("alice").await, AddOutcome::Added(0));
        assert_eq!(registry.try_add("bob").await, AddOutcome::Added(1));
        assert_eq!(registry.try_add("carol").await, AddOutcome::Added(2));

        registry.remove(1).await;
        assert_eq!(registry.logged_in().await, 2);
        assert_eq!(registry.try_add("dave").await, AddOutcome::Added(1));

        // The same user may log in again once the old slot is gone.
        registry.remove(0).await;
        assert_eq!(registry.try_add("alice").await, AddOutcome::Added(0));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let registry = SessionRegistry::new();
        for i in 0..MAX_SESSIONS {
            assert_eq!(registry.try_add(&format!("user{i}")).await, AddOutcome::Added(i));
        }
        assert_eq!(registry.try_add("overflow").await, AddOutcome::Full);

        registry.remove(7).await;
        assert_eq!(registry.try_add("overflow").await, AddOutcome::Added(7));
    }
}
