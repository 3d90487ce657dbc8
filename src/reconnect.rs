//! Drives reconnection attempts for participants whose transport dropped.
//!
//! The controller owns only the backoff loop and its bookkeeping; the
//! actual reconnection work is an externally provided capability. Every
//! loop is attached to a cancellation signal and is reaped on shutdown.

use crate::error::CoreError;
use crate::id_types::{ParticipantId, RoomId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectionState {
    None,
    Reconnecting,
    Reconnected,
    Failed,
}

/// Why a reconnection ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    MaxAttempts,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub total_timeout: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        ReconnectionConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            total_timeout: Duration::from_secs(120),
        }
    }
}

/// One failed attempt, kept in the status history.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub number: u32,
    pub at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconnectionStatus {
    pub room: RoomId,
    pub state: ReconnectionState,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub history: Vec<AttemptRecord>,
    pub cause: Option<FailureCause>,
}

/// The externally provided reconnection capability.
#[async_trait]
pub trait ReconnectAttempt: Send + Sync {
    async fn attempt(&self, room: &RoomId, participant: &ParticipantId) -> Result<(), CoreError>;
}

pub type ReconnectionHandler = dyn Fn(&RoomId, &ParticipantId, ReconnectionState) + Send + Sync;

/// Record lifetime after reaching a terminal state.
const CLEANUP_DELAY: Duration = Duration::from_secs(5);

struct Inner {
    config: ReconnectionConfig,
    records: DashMap<ParticipantId, Arc<StdMutex<ReconnectionStatus>>>,
    cancels: DashMap<ParticipantId, Arc<Notify>>,
    on_result: RwLock<Option<Arc<ReconnectionHandler>>>,
    cleanup_delay: Duration,
}

#[derive(Clone)]
pub struct ReconnectionController {
    inner: Arc<Inner>,
}

impl ReconnectionController {
    pub fn new(config: ReconnectionConfig) -> Self {
        ReconnectionController {
            inner: Arc::new(Inner {
                config,
                records: DashMap::new(),
                cancels: DashMap::new(),
                on_result: RwLock::new(None),
                cleanup_delay: CLEANUP_DELAY,
            }),
        }
    }

    #[cfg(test)]
    fn with_cleanup_delay(config: ReconnectionConfig, cleanup_delay: Duration) -> Self {
        ReconnectionController {
            inner: Arc::new(Inner {
                config,
                records: DashMap::new(),
                cancels: DashMap::new(),
                on_result: RwLock::new(None),
                cleanup_delay,
            }),
        }
    }

    /// Registers the handler fired once per terminal state. Replaces any
    /// previous handler.
    pub fn on_result<F>(&self, handler: F)
    where
        F: Fn(&RoomId, &ParticipantId, ReconnectionState) + Send + Sync + 'static,
    {
        *self.inner.on_result.write().unwrap() = Some(Arc::new(handler));
    }

    /// Starts the backoff loop for a disconnected participant.
    ///
    /// Rejects when a loop is already running for the participant. With
    /// `max_attempts == 0` the loop fails immediately without attempting.
    pub fn start(
        &self,
        room: RoomId,
        participant: ParticipantId,
        attempt: Arc<dyn ReconnectAttempt>,
    ) -> Result<(), CoreError> {
        if let Some(existing) = self.inner.records.get(&participant) {
            if existing.lock().unwrap().state == ReconnectionState::Reconnecting {
                return Err(CoreError::InvalidState(format!(
                    "participant {} is already reconnecting",
                    participant
                )));
            }
        }

        let status = Arc::new(StdMutex::new(ReconnectionStatus {
            room: room.clone(),
            state: ReconnectionState::Reconnecting,
            attempts: 0,
            started_at: Utc::now(),
            last_attempt_at: None,
            history: Vec::new(),
            cause: None,
        }));
        let cancel = Arc::new(Notify::new());
        self.inner.records.insert(participant.clone(), status.clone());
        self.inner.cancels.insert(participant.clone(), cancel.clone());

        info!(room = %room, participant = %participant, "reconnection started");
        let controller = self.clone();
        tokio::spawn(async move {
            controller
                .run_loop(room, participant, attempt, status, cancel)
                .await;
        });
        Ok(())
    }

    async fn run_loop(
        &self,
        room: RoomId,
        participant: ParticipantId,
        attempt: Arc<dyn ReconnectAttempt>,
        status: Arc<StdMutex<ReconnectionStatus>>,
        cancel: Arc<Notify>,
    ) {
        let config = &self.inner.config;

        if config.max_attempts == 0 {
            self.finish(
                &room,
                &participant,
                &status,
                ReconnectionState::Failed,
                Some(FailureCause::MaxAttempts),
            );
            return;
        }

        let deadline = Instant::now() + config.total_timeout;
        let mut delay = config.initial_delay;

        loop {
            tokio::select! {
                _ = cancel.notified() => {
                    self.finish(
                        &room,
                        &participant,
                        &status,
                        ReconnectionState::Failed,
                        Some(FailureCause::Cancelled),
                    );
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                _ = cancel.notified() => {
                    self.finish(
                        &room,
                        &participant,
                        &status,
                        ReconnectionState::Failed,
                        Some(FailureCause::Cancelled),
                    );
                    return;
                }
                outcome = attempt.attempt(&room, &participant) => outcome,
            };

            match outcome {
                Ok(()) => {
                    self.finish(&room, &participant, &status, ReconnectionState::Reconnected, None);
                    return;
                }
                Err(err) => {
                    let attempts = {
                        let mut status = status.lock().unwrap();
                        status.attempts += 1;
                        status.last_attempt_at = Some(Utc::now());
                        let number = status.attempts;
                        status.history.push(AttemptRecord {
                            number,
                            at: Utc::now(),
                            error: err.to_string(),
                        });
                        status.attempts
                    };
                    warn!(
                        room = %room,
                        participant = %participant,
                        attempt = attempts,
                        error = %err,
                        "reconnection attempt failed"
                    );
                    if attempts >= config.max_attempts {
                        self.finish(
                            &room,
                            &participant,
                            &status,
                            ReconnectionState::Failed,
                            Some(FailureCause::MaxAttempts),
                        );
                        return;
                    }
                    if Instant::now() >= deadline {
                        self.finish(
                            &room,
                            &participant,
                            &status,
                            ReconnectionState::Failed,
                            Some(FailureCause::Timeout),
                        );
                        return;
                    }
                }
            }

            delay = delay.mul_f64(config.backoff_multiplier).min(config.max_delay);
        }
    }

    fn finish(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
        status: &Arc<StdMutex<ReconnectionStatus>>,
        state: ReconnectionState,
        cause: Option<FailureCause>,
    ) {
        {
            let mut status = status.lock().unwrap();
            status.state = state;
            status.cause = cause;
        }
        info!(room = %room, participant = %participant, state = ?state, cause = ?cause, "reconnection finished");

        let handler = self.inner.on_result.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(room, participant, state);
        }

        // Keep the terminal record around briefly for status queries.
        let inner = self.inner.clone();
        let participant = participant.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.cleanup_delay).await;
            inner.records.remove(&participant);
            inner.cancels.remove(&participant);
        });
    }

    /// Cancels an in-flight loop; the participant left explicitly or its
    /// room closed. No-op when nothing is running.
    pub fn cancel(&self, participant: &ParticipantId) {
        if let Some(cancel) = self.inner.cancels.get(participant) {
            cancel.notify_one();
        }
    }

    pub fn status(&self, participant: &ParticipantId) -> Option<ReconnectionStatus> {
        self.inner
            .records
            .get(participant)
            .map(|entry| entry.value().lock().unwrap().clone())
    }

    pub fn state(&self, participant: &ParticipantId) -> ReconnectionState {
        self.status(participant)
            .map(|s| s.state)
            .unwrap_or(ReconnectionState::None)
    }

    /// Cancels every in-flight loop.
    pub fn shutdown(&self) {
        for entry in self.inner.cancels.iter() {
            entry.value().notify_one();
        }
    }
}
