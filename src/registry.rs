use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::CheckoutError;
use crate::model::Owner;
use crate::selector::{QueueSelector, SessionLease};
use crate::store::DocumentStore;

/// Opaque identifier of one logged-in reviewer session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from_cookie(value: impl Into<String>) -> Option<Self> {
        let value = value.into().trim().to_string();
        (!value.is_empty()).then_some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One session's state. Requests for the same session serialize on it.
pub type SessionHandle = Arc<AsyncMutex<SessionLease>>;

/// Process-local map of live sessions. The map lock is held only to insert,
/// look up or remove; store work happens under the per-session lock.
pub struct SessionRegistry<S: DocumentStore> {
    selector: Arc<QueueSelector<S>>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl<S: DocumentStore> SessionRegistry<S> {
    pub fn new(selector: Arc<QueueSelector<S>>) -> Self {
        Self {
            selector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn selector(&self) -> &Arc<QueueSelector<S>> {
        &self.selector
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        // The map stays consistent even if a holder panicked
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fresh session, sweeping lapsed leases first. A failed sweep
    /// does not block the login.
    #[instrument(skip_all, fields(owner = %owner))]
    pub async fn login(&self, owner: &Owner) -> SessionId {
        let partition = &self.selector.config().partition;
        match self.selector.leases().sweep_expired(partition).await {
            Ok(cleared) if cleared > 0 => info!("Login sweep cleared {} leases", cleared),
            Ok(_) => {}
            Err(e) => warn!("Login sweep failed: {}", e),
        }

        let id = SessionId::generate();
        self.sessions()
            .insert(id.clone(), Arc::new(AsyncMutex::new(SessionLease::new())));
        info!("Session {} started", id);
        id
    }

    /// The session for `id`, created empty if it is not known yet.
    pub fn session(&self, id: &SessionId) -> SessionHandle {
        Arc::clone(
            self.sessions()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(SessionLease::new()))),
        )
    }

    /// Drop the session, releasing any record it still holds. Returns whether
    /// a lease was released.
    #[instrument(skip_all, fields(owner = %owner, session = %id))]
    pub async fn logout(&self, id: &SessionId, owner: &Owner) -> Result<bool, CheckoutError> {
        let removed = self.sessions().remove(id);
        let Some(handle) = removed else {
            return Ok(false);
        };
        let mut session = handle.lock().await;
        let released = self.selector.release_current(&mut session, owner).await?;
        info!("Session {} ended", id);
        Ok(released)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
