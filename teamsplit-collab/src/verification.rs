//! One-time codes gating presence claims.
//!
//! ```text
//! request_code(p, s) ──► 6-digit code ──► VerificationDispatcher (email/phone)
//!        │                 valid 5 min
//!        ▼
//! verify_and_claim(p, s, code) ──► PresenceRegistry::claim(p, s)
//! ```
//!
//! Codes are keyed by (participant, session) and consumed on success.
//! Delivery is fire-and-forget: a failed dispatch is logged, never returned.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use teamsplit_core::{ContactChannel, EngineError, Participant, ParticipantId, SessionId};

use crate::presence::{ClaimOutcome, PresenceRegistry};
use crate::store::{SharedStateStore, Snapshot};

/// Delivers codes to participants.
pub trait VerificationDispatcher: Send + Sync {
    fn dispatch(
        &self,
        participant: &Participant,
        channel: &ContactChannel,
        code: &str,
    ) -> Result<(), String>;
}

/// Writes codes to the log. For development deployments.
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl VerificationDispatcher for LogDispatcher {
    fn dispatch(
        &self,
        participant: &Participant,
        channel: &ContactChannel,
        code: &str,
    ) -> Result<(), String> {
        log::info!("Verification code for {} via {channel}: {code}", participant.id);
        Ok(())
    }
}

/// A code handed to a [`ChannelDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedCode {
    pub participant: ParticipantId,
    pub channel: ContactChannel,
    pub code: String,
}

/// Forwards codes into an mpsc channel for an embedding application.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<DispatchedCode>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchedCode>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl VerificationDispatcher for ChannelDispatcher {
    fn dispatch(
        &self,
        participant: &Participant,
        channel: &ContactChannel,
        code: &str,
    ) -> Result<(), String> {
        self.tx
            .send(DispatchedCode {
                participant: participant.id.clone(),
                channel: channel.clone(),
                code: code.to_string(),
            })
            .map_err(|_| "receiver dropped".to_string())
    }
}

/// Verification settings.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// How long a code stays valid
    pub code_ttl: Duration,
    /// Wrong guesses before a code is discarded
    pub max_attempts: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(5 * 60),
            max_attempts: 5,
        }
    }
}

impl VerificationConfig {
    pub fn for_testing() -> Self {
        Self {
            code_ttl: Duration::from_millis(200),
            max_attempts: 3,
        }
    }
}

struct PendingCode {
    code: String,
    expires_at: Instant,
    failures: u32,
}

/// Issues and checks codes, then claims.
pub struct VerificationGate {
    store: Arc<SharedStateStore>,
    presence: PresenceRegistry,
    dispatcher: Arc<dyn VerificationDispatcher>,
    config: VerificationConfig,
    pending: Mutex<HashMap<(ParticipantId, SessionId), PendingCode>>,
}

impl VerificationGate {
    pub fn new(
        store: Arc<SharedStateStore>,
        dispatcher: Arc<dyn VerificationDispatcher>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            presence: PresenceRegistry::new(store.clone()),
            store,
            dispatcher,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn generate_code() -> String {
        rand::thread_rng().gen_range(100_000..1_000_000u32).to_string()
    }

    /// Issue a fresh code for (participant, session) and dispatch it.
    ///
    /// Replaces any earlier code for the same pair. Returns the channel the
    /// code was sent to.
    pub async fn request_code(
        &self,
        participant: &ParticipantId,
        session: SessionId,
    ) -> Result<ContactChannel, EngineError> {
        let snapshot = self.store.read().await;
        let entry = snapshot
            .state
            .participant(participant)
            .ok_or_else(|| EngineError::NoSuchParticipant(participant.clone()))?;
        let channel = entry
            .contact_channels()
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::NoContactChannel(participant.clone()))?;

        let code = Self::generate_code();
        {
            let mut pending = self.pending.lock().await;
            let now = Instant::now();
            pending.retain(|_, p| p.expires_at > now);
            pending.insert(
                (participant.clone(), session),
                PendingCode {
                    code: code.clone(),
                    expires_at: now + self.config.code_ttl,
                    failures: 0,
                },
            );
        }

        if let Err(e) = self.dispatcher.dispatch(entry, &channel, &code) {
            log::warn!("Failed to deliver code to {participant} via {channel}: {e}");
        } else {
            log::debug!("Code for {participant} dispatched via {channel}");
        }
        Ok(channel)
    }

    /// Check `code` and, on success, claim `participant` for `session`.
    pub async fn verify_and_claim(
        &self,
        participant: &ParticipantId,
        session: SessionId,
        code: &str,
    ) -> Result<(ClaimOutcome, Arc<Snapshot>), EngineError> {
        let key = (participant.clone(), session);
        {
            let mut pending = self.pending.lock().await;
            let entry = pending.get_mut(&key).ok_or(EngineError::InvalidCode)?;

            if Instant::now() >= entry.expires_at {
                pending.remove(&key);
                return Err(EngineError::CodeExpired);
            }
            if entry.code != code.trim() {
                entry.failures += 1;
                if entry.failures >= self.config.max_attempts {
                    log::warn!("Too many wrong codes for {participant}, code discarded");
                    pending.remove(&key);
                }
                return Err(EngineError::InvalidCode);
            }
            pending.remove(&key);
        }

        self.presence.claim(participant, session).await
    }

    /// Codes still outstanding (expired ones included until pruned).
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Forget codes issued to `session`.
    pub async fn forget_session(&self, session: SessionId) {
        self.pending.lock().await.retain(|(_, s), _| *s != session);
    }
}
