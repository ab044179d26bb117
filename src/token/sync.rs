//! Token Synchronizer
//!
//! Detects a token issued elsewhere by polling every backend with a growing
//! interval until a quorum agrees, then propagates the agreed value back to
//! every backend and notifies subscribers once.
//!
//! Detection runs as an explicit state machine:
//!
//! ```text
//! Polling --quorum--> Converged
//!    |
//!    +--deadline--> recovery pass --value--> Converged
//!                                 --none---> TimedOut
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::BackendKind;
use super::notify::{NotificationBatcher, TokenEvent, TokenNotification};
use super::store::{TokenStore, WriteReport};
use crate::error::{ApiError, ApiResult};
use crate::types::{PollingProfile, TokenSet};

/// One backend's answer in one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    pub method: BackendKind,
    pub found: bool,
    /// The access token seen, if any.
    pub value: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Detection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionState {
    Polling { cycle: u32, interval: Duration },
    Converged(TokenSet),
    TimedOut,
}

/// A distinct token value seen during one cycle.
struct Candidate {
    tokens: TokenSet,
    votes: usize,
    // index of the first backend (in write order) reporting it
    first_seen: usize,
}

/// Multi-backend detector and propagator.
pub struct TokenSynchronizer {
    store: Arc<TokenStore>,
    notifier: NotificationBatcher,
    profile: PollingProfile,
}

impl TokenSynchronizer {
    pub fn new(store: Arc<TokenStore>, notifier: NotificationBatcher, profile: PollingProfile) -> Self {
        Self {
            store,
            notifier,
            profile,
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn profile(&self) -> &PollingProfile {
        &self.profile
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TokenNotification> {
        self.notifier.subscribe()
    }

    /// Deliver pending notifications without waiting for the batch window.
    pub async fn flush_notifications(&self) {
        self.notifier.flush().await
    }

    /// Query every backend once.
    pub async fn poll_once(&self) -> Vec<DetectionResult> {
        self.sweep().await.0
    }

    /// Detect with the configured profile.
    pub async fn detect(
        &self,
        deadline: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> ApiResult<TokenSet> {
        let profile = self.profile.clone();
        self.detect_with_profile(&profile, deadline, cancel).await
    }

    /// Fast fallback after a popup authorization whose callback never arrived.
    pub async fn emergency_detect(&self, cancel: Option<&CancellationToken>) -> ApiResult<TokenSet> {
        self.detect_with_profile(&PollingProfile::emergency(), None, cancel)
            .await
    }

    /// Poll until a quorum of backends report the same token.
    ///
    /// The effective deadline never exceeds `profile.max_duration`.
    #[instrument(skip_all, fields(quorum = profile.quorum))]
    pub async fn detect_with_profile(
        &self,
        profile: &PollingProfile,
        deadline: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> ApiResult<TokenSet> {
        let deadline = deadline
            .map(|d| d.min(profile.max_duration))
            .unwrap_or(profile.max_duration);
        let methods = self.store.backends().len();
        let quorum = profile.quorum.min(methods).max(1);
        let started = Instant::now();

        let mut state = DetectionState::Polling {
            cycle: 0,
            interval: profile.base_interval,
        };

        loop {
            state = match state {
                DetectionState::Polling { cycle, interval } => {
                    let (_, candidates) = self.sweep().await;
                    if let Some(best) = best_candidate(candidates) {
                        if best.votes >= quorum {
                            debug!(cycle, votes = best.votes, "Token quorum reached");
                            DetectionState::Converged(best.tokens)
                        } else {
                            self.next_cycle(profile, cycle, interval, started, deadline, cancel)
                                .await?
                        }
                    } else {
                        self.next_cycle(profile, cycle, interval, started, deadline, cancel)
                            .await?
                    }
                }
                DetectionState::Converged(tokens) => {
                    self.propagate(tokens.clone()).await?;
                    info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Token detected"
                    );
                    return Ok(tokens);
                }
                DetectionState::TimedOut => {
                    // recovery pass: accept the best value without quorum
                    let (_, candidates) = self.sweep().await;
                    match best_candidate(candidates) {
                        Some(best) => {
                            info!(votes = best.votes, "Token recovered after deadline");
                            DetectionState::Converged(best.tokens)
                        }
                        None => {
                            let elapsed = started.elapsed();
                            warn!(elapsed_ms = elapsed.as_millis() as u64, methods, "Token detection timed out");
                            return Err(ApiError::DetectionTimeout { elapsed, methods });
                        }
                    }
                }
            };
        }
    }

    /// Grow the interval and sleep, or time out.
    async fn next_cycle(
        &self,
        profile: &PollingProfile,
        cycle: u32,
        interval: Duration,
        started: Instant,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> ApiResult<DetectionState> {
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return Ok(DetectionState::TimedOut);
        }

        let grown = interval
            .mul_f64(profile.growth_factor.max(1.0))
            .min(profile.max_interval);
        let jitter = profile.jitter_max.mul_f64(rand::random::<f64>());
        let sleep = (grown + jitter).min(deadline - elapsed);

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(ApiError::Cancelled { attempts: cycle + 1 });
                    }
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            None => tokio::time::sleep(sleep).await,
        }

        Ok(DetectionState::Polling {
            cycle: cycle + 1,
            interval: grown,
        })
    }

    async fn sweep(&self) -> (Vec<DetectionResult>, Vec<Candidate>) {
        let mut results = Vec::with_capacity(self.store.backends().len());
        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        for (index, backend) in self.store.backends().iter().enumerate() {
            let loaded = match backend.load().await {
                Ok(loaded) => loaded,
                Err(error) => {
                    debug!(backend = %backend.kind(), error = %error, "Backend unreadable during detection");
                    None
                }
            };

            results.push(DetectionResult {
                method: backend.kind(),
                found: loaded.is_some(),
                value: loaded.as_ref().map(|t| t.access_token.clone()),
                observed_at: Utc::now(),
            });

            if let Some(tokens) = loaded {
                candidates
                    .entry(tokens.access_token.clone())
                    .and_modify(|c| c.votes += 1)
                    .or_insert(Candidate {
                        tokens,
                        votes: 1,
                        first_seen: index,
                    });
            }
        }

        (results, candidates.into_values().collect())
    }

    /// Make `tokens` canonical everywhere and notify subscribers.
    pub async fn propagate(&self, tokens: TokenSet) -> ApiResult<WriteReport> {
        let report = self.store.set(tokens.clone()).await?;
        self.notifier.notify(TokenEvent::Updated(tokens));
        Ok(report)
    }

    /// Clear every backend and notify subscribers.
    pub async fn clear(&self) -> WriteReport {
        let report = self.store.clear().await;
        self.notifier.notify(TokenEvent::Cleared);
        report
    }
}

/// Most votes wins; ties go to the value seen first in write order.
fn best_candidate(candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates
        .into_iter()
        .max_by(|a, b| a.votes.cmp(&b.votes).then(b.first_seen.cmp(&a.first_seen)))
}
