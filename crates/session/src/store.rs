//! Session store: the single owner of session lifecycle.
//!
//! Each session lives in its own slot with two locks:
//! - a read/write lock over the session state, held only briefly, so
//!   lookups never wait behind a running query;
//! - a query gate, held by a [`SessionLease`] for the whole of one query, so
//!   queries against the same session are linearized.
//!
//! The outer map is only locked for insert, lookup and removal, so
//! operations on distinct sessions proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use switchboard_core::clock::{Clock, SystemClock};
use switchboard_core::error::SessionError;
use switchboard_core::event::{DomainEvent, EventBus, ExpiryReason};
use switchboard_core::message::{Metadata, Role, SessionId, Turn};

use crate::window::ConversationWindow;

/// A server-side record of one ongoing conversation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Always `last_activity_at + ttl`.
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
    /// Completed queries. Only grows.
    pub turn_count: u64,
    pub history: ConversationWindow,
    pub metadata: Metadata,
}

impl Session {
    fn new(id: SessionId, now: DateTime<Utc>, ttl: Duration, metadata: Metadata) -> Self {
        Self {
            id,
            created_at: now,
            last_activity_at: now,
            expires_at: expiry_after(now, ttl),
            ttl,
            turn_count: 0,
            history: ConversationWindow::new(),
            metadata,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
        self.expires_at = expiry_after(now, self.ttl);
        self.turn_count += 1;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            turn_count: self.turn_count,
            history_len: self.history.len(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Serializable view of a session without its history.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub turn_count: u64,
    pub history_len: usize,
    pub metadata: Metadata,
}

struct SessionSlot {
    state: RwLock<Session>,
    gate: Arc<Mutex<()>>,
    removed: AtomicBool,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            state: RwLock::new(session),
            gate: Arc::new(Mutex::new(())),
            removed: AtomicBool::new(false),
        }
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

/// Exclusive hold on one session for the duration of a query.
///
/// While a lease is alive, other queries on the same session wait and the
/// background sweep skips the session. Dropping the lease releases it.
pub struct SessionLease {
    id: SessionId,
    slot: Arc<SessionSlot>,
    _gate: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current state of the leased session.
    pub async fn session(&self) -> Session {
        self.slot.state.read().await.clone()
    }

    /// History to hand to inference: no trailing unanswered user turn.
    pub async fn settled_history(&self) -> Vec<Turn> {
        self.slot.state.read().await.history.settled()
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").field("id", &self.id).finish()
    }
}

/// Outcome of resolving an optional session id.
#[derive(Debug)]
pub enum Resolution {
    Existing(SessionLease),
    Created(SessionLease),
}

impl Resolution {
    pub fn is_new(&self) -> bool {
        matches!(self, Resolution::Created(_))
    }

    pub fn lease(&self) -> &SessionLease {
        match self {
            Resolution::Existing(lease) | Resolution::Created(lease) => lease,
        }
    }

    pub fn into_lease(self) -> SessionLease {
        match self {
            Resolution::Existing(lease) | Resolution::Created(lease) => lease,
        }
    }
}

/// In-memory session store keyed by session id.
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    window_max_turns: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl SessionStore {
    pub fn new(default_ttl: StdDuration, window_max_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            default_ttl: to_chrono(default_ttl),
            window_max_turns,
            event_bus: None,
        }
    }

    /// Use a different time source (tests use `ManualClock`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish lifecycle events to `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn default_ttl(&self) -> StdDuration {
        self.default_ttl.to_std().unwrap_or_default()
    }

    pub fn window_max_turns(&self) -> usize {
        self.window_max_turns
    }

    /// Create a session that expires after `ttl` of inactivity.
    pub async fn create(&self, ttl: StdDuration, metadata: Metadata) -> Session {
        let slot = self.insert_new(to_chrono(ttl), metadata).await;
        slot.state.read().await.clone()
    }

    /// Look up a live session. An expired session is removed on access,
    /// even while a query holds it; that query's commit then fails.
    pub async fn get(&self, id: &SessionId) -> Result<Session, SessionError> {
        let slot = self.slot(id).await?;
        {
            let session = slot.state.read().await;
            if !session.is_expired_at(self.clock.now()) {
                return Ok(session.clone());
            }
        }

        self.remove_slot(id, &slot, Removal::Expired(ExpiryReason::Lazy))
            .await;
        Err(SessionError::NotFound(id.to_string()))
    }

    /// Record a completed query: bump activity, expiry and turn count.
    pub async fn touch(&self, id: &SessionId) -> Result<Session, SessionError> {
        let slot = self.slot(id).await?;
        let now = self.clock.now();
        let mut session = slot.state.write().await;
        if slot.is_removed() || session.is_expired_at(now) {
            return Err(SessionError::NotFound(id.to_string()));
        }
        session.touch(now);
        Ok(session.clone())
    }

    /// Remove a session regardless of expiry. Returns whether it existed.
    pub async fn delete(&self, id: &SessionId) -> bool {
        let slot = match self.sessions.read().await.get(id) {
            Some(slot) => slot.clone(),
            None => return false,
        };
        self.remove_slot(id, &slot, Removal::Deleted).await
    }

    /// Acquire exclusive query access to an existing, live session.
    ///
    /// Waits for any in-flight query on the same session to finish first.
    pub async fn lease(&self, id: &SessionId) -> Result<SessionLease, SessionError> {
        let slot = self.slot(id).await?;
        let gate = slot.gate.clone().lock_owned().await;

        if slot.is_removed() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let expired = slot.state.read().await.is_expired_at(self.clock.now());
        if expired {
            self.remove_slot(id, &slot, Removal::Expired(ExpiryReason::Lazy))
                .await;
            return Err(SessionError::NotFound(id.to_string()));
        }

        Ok(SessionLease {
            id: id.clone(),
            slot,
            _gate: gate,
        })
    }

    /// Lease the given session, or create and lease a new one with the
    /// default TTL when no id is supplied.
    pub async fn resolve_or_create(
        &self,
        id: Option<&SessionId>,
        metadata: Metadata,
    ) -> Result<Resolution, SessionError> {
        match id {
            Some(id) => self.lease(id).await.map(Resolution::Existing),
            None => {
                let slot = Arc::new(SessionSlot::new(Session::new(
                    SessionId::new(),
                    self.clock.now(),
                    self.default_ttl,
                    metadata,
                )));
                // Lock before publishing the slot so the sweep can never see
                // it unleased.
                let gate = slot.gate.clone().lock_owned().await;
                let id = self.publish_slot(slot.clone()).await;
                Ok(Resolution::Created(SessionLease {
                    id,
                    slot,
                    _gate: gate,
                }))
            }
        }
    }

    /// Append one exchange to a leased session.
    ///
    /// Fails with `NotFound` if the session was deleted or expired while the
    /// lease was held. The user turn is otherwise always recorded. With an assistant reply the
    /// session is also touched; without one (failed inference) the turn
    /// count and expiry are left alone. A user turn left unanswered by an
    /// earlier failed query is discarded first so alternation holds.
    pub async fn commit(
        &self,
        lease: &SessionLease,
        user: &str,
        assistant: Option<&str>,
    ) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let mut session = lease.slot.state.write().await;
        if lease.slot.is_removed() {
            return Err(SessionError::NotFound(lease.id.to_string()));
        }
        if session.is_expired_at(now) {
            drop(session);
            self.remove_slot(&lease.id, &lease.slot, Removal::Expired(ExpiryReason::Lazy))
                .await;
            return Err(SessionError::NotFound(lease.id.to_string()));
        }

        if let Some(stale) = session.history.discard_unanswered() {
            debug!(
                session_id = %lease.id,
                sequence = stale.sequence,
                "Discarding unanswered user turn from a failed query"
            );
        }

        session.history.append(Role::User, user)?;
        if let Some(reply) = assistant {
            session.history.append(Role::Assistant, reply)?;
            session.touch(now);
        }

        let dropped = session.history.truncate_to_budget(self.window_max_turns);
        if dropped > 0 {
            debug!(session_id = %lease.id, dropped, "Truncated conversation window");
        }

        Ok(session.clone())
    }

    /// Remove every expired session that is not leased. Returns the number
    /// removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let candidates: Vec<(SessionId, Arc<SessionSlot>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut reaped = 0;
        for (id, slot) in candidates {
            let Ok(_gate) = slot.gate.try_lock() else {
                continue;
            };
            let expired = slot.state.read().await.is_expired_at(now);
            if expired
                && self
                    .remove_slot(&id, &slot, Removal::Expired(ExpiryReason::Sweep))
                    .await
            {
                reaped += 1;
            }
        }

        if reaped > 0 {
            let remaining = self.len().await;
            info!(reaped, remaining, "Expired sessions swept");
        }
        reaped
    }

    /// Summaries of all live sessions, most recently active first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let now = self.clock.now();
        let slots: Vec<Arc<SessionSlot>> =
            self.sessions.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            let session = slot.state.read().await;
            if !session.is_expired_at(now) {
                summaries.push(session.summary());
            }
        }
        summaries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        summaries
    }

    /// Number of stored sessions, including expired ones not yet reaped.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn slot(&self, id: &SessionId) -> Result<Arc<SessionSlot>, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn insert_new(&self, ttl: Duration, metadata: Metadata) -> Arc<SessionSlot> {
        let slot = Arc::new(SessionSlot::new(Session::new(
            SessionId::new(),
            self.clock.now(),
            ttl,
            metadata,
        )));
        self.publish_slot(slot.clone()).await;
        slot
    }

    async fn publish_slot(&self, slot: Arc<SessionSlot>) -> SessionId {
        let (id, expires_at) = {
            let session = slot.state.read().await;
            (session.id.clone(), session.expires_at)
        };
        self.sessions.write().await.insert(id.clone(), slot);

        info!(session_id = %id, %expires_at, "Session created");
        self.publish(DomainEvent::SessionCreated {
            session_id: id.to_string(),
            expires_at,
            timestamp: Utc::now(),
        });
        id
    }

    /// Remove `slot` if it is still the one stored under `id`.
    async fn remove_slot(&self, id: &SessionId, slot: &Arc<SessionSlot>, why: Removal) -> bool {
        {
            let mut sessions = self.sessions.write().await;
            match sessions.get(id) {
                Some(current) if Arc::ptr_eq(current, slot) => {
                    sessions.remove(id);
                }
                _ => return false,
            }
        }
        slot.removed.store(true, Ordering::SeqCst);

        let event = match why {
            Removal::Deleted => {
                info!(session_id = %id, "Session deleted");
                DomainEvent::SessionDeleted {
                    session_id: id.to_string(),
                    timestamp: Utc::now(),
                }
            }
            Removal::Expired(reason) => {
                info!(session_id = %id, ?reason, "Session expired");
                DomainEvent::SessionExpired {
                    session_id: id.to_string(),
                    reason,
                    timestamp: Utc::now(),
                }
            }
        };
        self.publish(event);
        true
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Removal {
    Deleted,
    Expired(ExpiryReason),
}

fn to_chrono(d: StdDuration) -> Duration {
    Duration::from_std(d).unwrap_or(Duration::MAX)
}

/// `now + ttl`, saturating at the latest representable instant.
fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
