//! Live sessions by identifier.
//!
//! The map lock is held only for lookup and insert. Whether an existing
//! session may be replaced is read from its settled marker, never from its
//! progress mutex, so the two locks are never nested.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use renderhub_core::error::CoreError;
use renderhub_core::types::SessionId;
use tokio::sync::RwLock;

use crate::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`.
    ///
    /// A live session with the same id is a [`CoreError::Conflict`]; a
    /// settled one is replaced and returned.
    pub async fn create_or_replace(
        &self,
        session: Session,
    ) -> Result<(Arc<Session>, Option<Arc<Session>>), CoreError> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(&session.id) {
            if !existing.is_settled() {
                return Err(CoreError::Conflict(format!(
                    "Session {} is still in progress",
                    session.id
                )));
            }
        }

        let session = Arc::new(session);
        let replaced = sessions.insert(session.id.clone(), Arc::clone(&session));
        if let Some(old) = &replaced {
            old.mark_retired();
        }
        Ok((session, replaced))
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn retire(&self, id: &SessionId) -> Option<Arc<Session>> {
        let retired = self.sessions.write().await.remove(id);
        if let Some(session) = &retired {
            session.mark_retired();
        }
        retired
    }

    /// Every registered session, oldest first, ties broken by id.
    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Sessions that have not settled yet.
    pub async fn live_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_settled())
            .count()
    }

    /// Remove sessions that settled at least `retention` ago.
    pub async fn retire_settled(&self, retention: Duration) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.settled_at().is_some_and(|at| at.elapsed() >= retention))
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.mark_retired();
            }
        }
        expired
    }
}
