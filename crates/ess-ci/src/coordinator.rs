//! Per-change build registry within one process.
//!
//! Builds in separate processes coordinate through
//! [`ChangeLease`](crate::ChangeLease) instead.
//!
//! At most one build per change key is active at a time. Beginning a build
//! for a key that already has one in flight cancels the older build's token
//! when asked to, which makes the older pipeline abort its current stage
//! and go straight to cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::obs;

#[derive(Debug)]
struct ActiveBuild {
    ticket: u64,
    token: CancellationToken,
}

type Registry = HashMap<String, ActiveBuild>;

/// Tracks the in-flight build of every change.
#[derive(Debug, Clone, Default)]
pub struct BuildCoordinator {
    active: Arc<Mutex<Registry>>,
    next_ticket: Arc<AtomicU64>,
}

impl BuildCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock leaves the map itself consistent.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new build for `change_key`.
    ///
    /// With `abort_previous`, the build currently registered for the key is
    /// cancelled. Without it, the previous build keeps running but loses its
    /// registration.
    pub fn begin(&self, change_key: &str, abort_previous: bool) -> BuildTicket {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();

        let previous = self.lock().insert(
            change_key.to_string(),
            ActiveBuild {
                ticket,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            if abort_previous {
                obs::emit_build_superseded(change_key, &previous.ticket);
                previous.token.cancel();
            } else {
                debug!(change_key = %change_key, previous = previous.ticket, "previous build left running");
            }
        }

        BuildTicket {
            coordinator: self.clone(),
            change_key: change_key.to_string(),
            ticket,
            token,
        }
    }

    /// Whether a build is registered for `change_key`.
    pub fn is_active(&self, change_key: &str) -> bool {
        self.lock().contains_key(change_key)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, change_key: &str, ticket: u64) {
        let mut active = self.lock();
        if active.get(change_key).map(|b| b.ticket) == Some(ticket) {
            active.remove(change_key);
        }
    }
}

/// Registration of one build. Dropping it deregisters the build unless a
/// newer build has taken over the key.
#[derive(Debug)]
pub struct BuildTicket {
    coordinator: BuildCoordinator,
    change_key: String,
    ticket: u64,
    token: CancellationToken,
}

impl BuildTicket {
    /// Token cancelled when this build is superseded.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn change_key(&self) -> &str {
        &self.change_key
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for BuildTicket {
    fn drop(&mut self) {
        self.coordinator.release(&self.change_key, self.ticket);
    }
}
