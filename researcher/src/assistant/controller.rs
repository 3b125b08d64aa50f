//! Conversation controller: drives each user's session through the pipeline.
//!
//! Inbound text is applied to the session under a per-user lock. The effects
//! that come back are executed without holding that lock, so a slow model or
//! search call never blocks other users, and the same user gets a "still
//! working" reply instead of waiting. Stage results are fed back only if the
//! session they were started for is still current.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::email::Mailer;
use super::error::{ChatError, StoreError};
use super::graph::ResearchGraph;
use super::state::{Effect, Event, Session, Stage, State, UserId, EXPIRED};
use super::store::SessionStore;

/// Outbound side of a chat transport.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_text(&self, user: &UserId, text: &str) -> Result<(), ChatError>;

    async fn send_typing(&self, user: &UserId) -> Result<(), ChatError>;
}

/// Effects produced by an inbound message, still to be executed.
#[derive(Debug)]
pub struct Pending {
    user: UserId,
    session_id: Uuid,
    effects: Vec<Effect>,
}

pub struct ConversationController {
    store: Arc<dyn SessionStore>,
    graph: Arc<ResearchGraph>,
    mailer: Arc<dyn Mailer>,
    sink: Arc<dyn ChatSink>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
    idle_timeout: Duration,
}

const INTERNAL_ERROR: &str = "Sorry, something went wrong on my side. Please send your question again.";

impl ConversationController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        graph: Arc<ResearchGraph>,
        mailer: Arc<dyn Mailer>,
        sink: Arc<dyn ChatSink>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            graph,
            mailer,
            sink,
            locks: DashMap::new(),
            idle_timeout,
        }
    }

    fn lock_for(&self, user: &UserId) -> Arc<Mutex<()>> {
        self.locks.entry(user.clone()).or_default().clone()
    }

    /// Handles one inbound message and runs every resulting stage to completion.
    ///
    /// The pipeline lives inside the returned future. Transports whose callers
    /// may go away mid-request call `accept` and spawn `drive` instead.
    pub async fn handle_message(&self, user: UserId, text: &str) {
        match self.accept(user.clone(), text).await {
            Ok(pending) => self.drive(pending).await,
            Err(e) => {
                tracing::error!(%user, error = %e, "could not load session");
                self.reply(&user, INTERNAL_ERROR).await;
            }
        }
    }

    /// Applies an inbound message to the user's session.
    ///
    /// Cheap: no external calls happen here, so transports can call it inline
    /// to keep per-chat ordering and hand the result to `drive` in a task.
    pub async fn accept(&self, user: UserId, text: &str) -> Result<Pending, StoreError> {
        let lock = self.lock_for(&user);
        let _guard = lock.lock().await;
        let now = SystemTime::now();

        let mut effects = Vec::new();
        let mut session = match self.store.get(&user).await? {
            Some(session) => session,
            None => self.store.create(&user, now).await?,
        };

        if session.is_idle(now, self.idle_timeout)
            && !matches!(session.state, State::WaitingQuery | State::Done)
        {
            tracing::info!(%user, session = %session.id, state = ?session.state, "session expired");
            session.reset(now);
            effects.push(Effect::Reply(EXPIRED.to_string()));
        }

        effects.extend(session.apply(Event::Inbound(text.to_string()), now));
        self.store.update(&session).await?;

        Ok(Pending {
            user,
            session_id: session.id,
            effects,
        })
    }

    /// Executes effects in order, feeding stage results back into the session.
    pub async fn drive(&self, pending: Pending) {
        let Pending {
            user,
            mut session_id,
            effects,
        } = pending;
        let span = tracing::info_span!("conversation", %user);

        async {
            let mut queue: VecDeque<Effect> = effects.into();
            while let Some(effect) = queue.pop_front() {
                let Some(event) = self.execute(&user, effect).await else {
                    continue;
                };
                match self.feed(&user, session_id, event).await {
                    Ok(Some((current, effects))) => {
                        session_id = current;
                        queue.extend(effects);
                    }
                    Ok(None) => {
                        tracing::debug!(session = %session_id, "discarding result for a stale session");
                        // Anything still queued belongs to the stale session as well.
                        queue.clear();
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "could not store stage result");
                        self.reply(&user, INTERNAL_ERROR).await;
                        return;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// True while a stage for the user's session is in flight.
    pub async fn is_busy(&self, user: &UserId) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(user)
            .await?
            .map(|session| session.state.is_busy())
            .unwrap_or(false))
    }

    async fn feed(
        &self,
        user: &UserId,
        session_id: Uuid,
        event: Event,
    ) -> Result<Option<(Uuid, Vec<Effect>)>, StoreError> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let Some(mut session) = self.store.get(user).await? else {
            return Ok(None);
        };
        if session.id != session_id {
            return Ok(None);
        }
        let effects = session.apply(event, SystemTime::now());
        self.store.update(&session).await?;
        Ok(Some((session.id, effects)))
    }

    async fn reply(&self, user: &UserId, text: &str) {
        if let Err(e) = self.sink.send_text(user, text).await {
            tracing::warn!(%user, error = %e, "failed to deliver reply");
        }
    }

    /// Runs one effect; stage effects turn into the event describing their outcome.
    async fn execute(&self, user: &UserId, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Reply(text) => {
                self.reply(user, &text).await;
                None
            }
            Effect::Typing => {
                if let Err(e) = self.sink.send_typing(user).await {
                    tracing::debug!(error = %e, "typing indicator failed");
                }
                None
            }
            Effect::Clarify { query } => Some(stage_result(
                Stage::Clarify,
                self.graph.clarify(&query).await.map(Event::Clarified),
            )),
            Effect::Refine { query, answers } => Some(stage_result(
                Stage::Refine,
                self.graph.refine(&query, &answers).await.map(Event::Refined),
            )),
            Effect::Plan { refined_query } => Some(stage_result(
                Stage::Plan,
                self.graph.plan(&refined_query).await.map(Event::Planned),
            )),
            Effect::Search { queries } => {
                let evidence = self.graph.search(&queries).await;
                tracing::info!(queries = queries.len(), records = evidence.len(), "evidence gathered");
                Some(Event::EvidenceGathered(evidence))
            }
            Effect::Write {
                refined_query,
                evidence,
            } => Some(stage_result(
                Stage::Write,
                self.graph
                    .write(&refined_query, &evidence)
                    .await
                    .map(Event::ReportWritten),
            )),
            Effect::SendEmail { to, subject, report } => {
                match self.mailer.send(&to, &subject, &report.render()).await {
                    Ok(()) => Some(Event::EmailSent),
                    Err(e) => {
                        tracing::warn!(error = %e, "email delivery failed");
                        Some(Event::EmailFailed(e.to_string()))
                    }
                }
            }
        }
    }

    /// Deletes sessions idle for longer than the timeout. Returns how many were removed.
    pub async fn sweep_idle(&self, now: SystemTime) -> Result<usize, StoreError> {
        let Some(cutoff) = now.checked_sub(self.idle_timeout) else {
            return Ok(0);
        };
        let mut removed = 0;
        for user in self.store.idle_since(cutoff).await? {
            let lock = self.lock_for(&user);
            let _guard = lock.lock().await;
            // Re-check under the lock; the user may have written in the meantime.
            let still_idle = self
                .store
                .get(&user)
                .await?
                .map(|session: Session| session.is_idle(now, self.idle_timeout))
                .unwrap_or(false);
            if still_idle {
                self.store.delete(&user).await?;
                removed += 1;
            }
            drop(_guard);
            drop(lock);
            self.locks.remove_if(&user, |_, lock| Arc::strong_count(lock) == 1);
        }
        if removed > 0 {
            tracing::info!(removed, "expired idle sessions");
        }
        Ok(removed)
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_idle(SystemTime::now()).await {
                    tracing::warn!(error = %e, "idle session sweep failed");
                }
            }
        })
    }
}

fn stage_result(stage: Stage, result: anyhow::Result<Event>) -> Event {
    result.unwrap_or_else(|e| Event::StageFailed {
        stage,
        reason: format!("{:#}", e),
    })
}
