//! Server-side cache of resumable sessions

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Result, VlessError};

pub const TICKET_LEN: usize = 16;
pub const MARKER_LEN: usize = 16;
pub const PFS_KEY_LEN: usize = 64;

pub type Ticket = [u8; TICKET_LEN];
pub type Marker = [u8; MARKER_LEN];

/// A resumable session: the forward-secret key and the markers already used with it.
#[derive(Debug)]
pub struct Session {
    pfs_key: Zeroizing<[u8; PFS_KEY_LEN]>,
    expire: Instant,
    markers: DashSet<Marker>,
}

impl Session {
    pub fn pfs_key(&self) -> &[u8; PFS_KEY_LEN] {
        &self.pfs_key
    }

    pub fn expire(&self) -> Instant {
        self.expire
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expire
    }

    pub fn markers_seen(&self) -> usize {
        self.markers.len()
    }
}

/// Concurrent ticket → session map with a background expiry sweep.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Ticket, Arc<Session>>>,
    closed: AtomicBool,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ticket: Ticket, pfs_key: &[u8; PFS_KEY_LEN], lifetime: Duration) {
        let session = Arc::new(Session {
            pfs_key: Zeroizing::new(*pfs_key),
            expire: Instant::now() + lifetime,
            markers: DashSet::new(),
        });
        self.sessions.write().insert(ticket, session);
    }

    /// Find a usable session. Expired entries are reported even before the sweep removes them.
    pub fn lookup(&self, ticket: &Ticket) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .get(ticket)
            .cloned()
            .ok_or(VlessError::SessionNotFound)?;
        if session.is_expired(Instant::now()) {
            return Err(VlessError::SessionExpired);
        }
        Ok(session)
    }

    /// Record `marker` for `session`, failing if it was already used.
    ///
    /// A replay leaves the session in place for other markers.
    pub fn check_and_mark_replay(&self, session: &Session, marker: Marker) -> Result<()> {
        if session.markers.insert(marker) {
            Ok(())
        } else {
            Err(VlessError::ReplayDetected)
        }
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Stop the sweeper. Stored sessions remain readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sweep every `interval` on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// closed or dropped. Returns `None` when called outside a runtime.
    pub fn spawn_sweeper(
        store: &Arc<Self>,
        interval: Duration,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime; session sweeper not started");
                return None;
            }
        };
        let weak: Weak<Self> = Arc::downgrade(store);
        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                if store.is_closed() {
                    break;
                }
                let removed = store.sweep();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "swept expired sessions");
                }
            }
        }))
    }
}
