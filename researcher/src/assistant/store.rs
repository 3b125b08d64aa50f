use async_trait::async_trait;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::RwLock;

use super::error::StoreError;
use super::state::{Session, UserId};

/// Storage for conversation sessions, keyed by user.
///
/// The controller serializes access per user, so implementations only need
/// to keep distinct users' entries independent.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, user: &UserId) -> Result<Option<Session>, StoreError>;

    async fn create(&self, user: &UserId, now: SystemTime) -> Result<Session, StoreError>;

    /// Replaces an existing session; fails with `StoreError::NotFound` otherwise.
    async fn update(&self, session: &Session) -> Result<(), StoreError>;

    async fn delete(&self, user: &UserId) -> Result<(), StoreError>;

    /// Users whose session has not been touched since `cutoff`.
    async fn idle_since(&self, cutoff: SystemTime) -> Result<Vec<UserId>, StoreError>;
}

/// Process-local store; sessions do not survive a restart.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<UserId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, user: &UserId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(user).cloned())
    }

    async fn create(&self, user: &UserId, now: SystemTime) -> Result<Session, StoreError> {
        let session = Session::new(user.clone(), now);
        self.sessions.write().await.insert(user.clone(), session.clone());
        Ok(session)
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        // A deleted session is never brought back by a late write.
        let slot = sessions
            .get_mut(&session.user)
            .ok_or_else(|| StoreError::NotFound(session.user.clone()))?;
        *slot = session.clone();
        Ok(())
    }

    async fn delete(&self, user: &UserId) -> Result<(), StoreError> {
        self.sessions.write().await.remove(user);
        Ok(())
    }

    async fn idle_since(&self, cutoff: SystemTime) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.updated_at < cutoff)
            .map(|session| session.user.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::state::State;
    use std::time::Duration;

    #[tokio::test]
    async fn create_get_update_delete() {
        let store = InMemorySessionStore::new();
        let alice = UserId::from("alice");
        let now = SystemTime::now();

        assert!(store.get(&alice).await.unwrap().is_none());
        let mut session = store.create(&alice, now).await.unwrap();
        assert_eq!(store.get(&alice).await.unwrap().unwrap().id, session.id);

        session.state = State::Asking;
        store.update(&session).await.unwrap();
        assert_eq!(store.get(&alice).await.unwrap().unwrap().state, State::Asking);

        store.delete(&alice).await.unwrap();
        assert!(store.get(&alice).await.unwrap().is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn update_does_not_resurrect_deleted_sessions() {
        let store = InMemorySessionStore::new();
        let bob = UserId::from("bob");
        let session = store.create(&bob, SystemTime::now()).await.unwrap();
        store.delete(&bob).await.unwrap();

        match store.update(&session).await {
            Err(StoreError::NotFound(user)) => assert_eq!(user, bob),
            other => panic!("expected NotFound, got {:?}", other),
        }
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn idle_since_lists_only_stale_sessions() {
        let store = InMemorySessionStore::new();
        let start = SystemTime::now();
        store.create(&UserId::from("old"), start).await.unwrap();
        store
            .create(&UserId::from("fresh"), start + Duration::from_secs(120))
            .await
            .unwrap();

        let idle = store.idle_since(start + Duration::from_secs(60)).await.unwrap();
        assert_eq!(idle, vec![UserId::from("old")]);
    }
}
