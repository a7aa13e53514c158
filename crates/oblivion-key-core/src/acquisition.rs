//! Key acquisition: request, gate detection, redirect, and polling.
//!
//! All KeyService calls of one [`KeyAcquisitionController`] go through a
//! single flight lock, so at most one request is ever outstanding. Manual
//! calls wait for the lock; poll ticks skip while it is held.

use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::GateSignal;
use crate::protocol::{
    CheckKeyRequest, CheckKeyResponse, GenerateKeyRequest, GenerateKeyResponse,
    KeyServiceTransport, STANDARD_SYSTEM, ServiceReply,
};
use crate::redirect::{AdRedirect, DEFAULT_AD_TARGET_PARAM, Departure, Navigator, build_ad_redirect};
use crate::session::{SessionError, Sid};

pub const GENERIC_REJECTION_MESSAGE: &str = "Failed to get key";

const MAX_EXPIRY_HOURS: f64 = 24.0 * 365.0 * 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptStatus {
    #[default]
    Idle,
    Requesting,
    Gated,
    Polling,
    Issued,
    Failed,
}

impl AttemptStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requesting => "requesting",
            Self::Gated => "gated",
            Self::Polling => "polling",
            Self::Issued => "issued",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedKey {
    pub key: String,
    pub expires_in_hours: Option<f64>,
    pub issued_at: DateTime<Utc>,
}

impl IssuedKey {
    /// Display only; expiry is enforced by the KeyService.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let hours = self.expires_in_hours?;
        if !hours.is_finite() || hours < 0.0 {
            return None;
        }
        let seconds = (hours.min(MAX_EXPIRY_HOURS) * 3_600.0).round() as i64;
        Some(self.issued_at + chrono::Duration::seconds(seconds))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcquisitionAttempt {
    pub status: AttemptStatus,
    pub key: Option<IssuedKey>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("key service is warming up (http {status}, non-json reply); retry shortly")]
    ServiceWarmingUp { status: u16 },
    #[error("key service unreachable: {message}")]
    Unreachable { message: String },
    #[error("key service did not answer within {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
    #[error("{message}")]
    Rejected { message: String },
    #[error("no session found: {reason}")]
    NoSession { reason: String },
}

impl AcquisitionError {
    #[must_use]
    pub fn is_service_unavailable(&self) -> bool {
        matches!(
            self,
            Self::ServiceWarmingUp { .. } | Self::Unreachable { .. } | Self::TimedOut { .. }
        )
    }
}

impl From<SessionError> for AcquisitionError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::NoSession { reason } => Self::NoSession { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Issued(IssuedKey),
    Gated(AdRedirect),
    Failed(AcquisitionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerateOutcome {
    Issued {
        key: String,
        expires_in_hours: Option<f64>,
    },
    Gated,
    Failed(AcquisitionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyCheck {
    Valid {
        key: String,
        expires_in_hours: Option<f64>,
    },
    Expired,
    Missing,
}

pub fn interpret_generate_reply(reply: &ServiceReply, gate_signal: GateSignal) -> GenerateOutcome {
    if reply.is_forbidden() {
        return GenerateOutcome::Gated;
    }
    let Some(body) = reply.decode::<GenerateKeyResponse>() else {
        return GenerateOutcome::Failed(AcquisitionError::ServiceWarmingUp {
            status: reply.status,
        });
    };

    if body.success {
        return match non_empty(body.key) {
            Some(key) => GenerateOutcome::Issued {
                key,
                expires_in_hours: body.expires_in,
            },
            None => GenerateOutcome::Failed(rejection(body.message)),
        };
    }

    if gate_signal == GateSignal::ForbiddenOrUnsuccessful && reply.is_success() {
        return GenerateOutcome::Gated;
    }
    GenerateOutcome::Failed(rejection(body.message))
}

pub fn interpret_check_reply(reply: &ServiceReply) -> Result<KeyCheck, AcquisitionError> {
    let Some(body) = reply.decode::<CheckKeyResponse>() else {
        return Err(AcquisitionError::ServiceWarmingUp {
            status: reply.status,
        });
    };
    if !reply.is_success() {
        return Err(AcquisitionError::Rejected {
            message: format!("key check failed (http {})", reply.status),
        });
    }
    if !body.has_key {
        return Ok(KeyCheck::Missing);
    }
    if body.expired {
        return Ok(KeyCheck::Expired);
    }
    Ok(match non_empty(body.key) {
        Some(key) => KeyCheck::Valid {
            key,
            expires_in_hours: body.expires_in,
        },
        None => KeyCheck::Missing,
    })
}

fn rejection(message: Option<String>) -> AcquisitionError {
    AcquisitionError::Rejected {
        message: non_empty(message).unwrap_or_else(|| GENERIC_REJECTION_MESSAGE.to_string()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub ad_link_url: String,
    pub ad_target_param: String,
    pub verify_url: String,
    pub system: String,
    pub gate_signal: GateSignal,
    /// `None` leaves requests unbounded.
    pub request_timeout: Option<Duration>,
}

impl AcquisitionConfig {
    pub fn new(ad_link_url: impl Into<String>, verify_url: impl Into<String>) -> Self {
        Self {
            ad_link_url: ad_link_url.into(),
            ad_target_param: DEFAULT_AD_TARGET_PARAM.to_string(),
            verify_url: verify_url.into(),
            system: STANDARD_SYSTEM.to_string(),
            gate_signal: GateSignal::default(),
            request_timeout: None,
        }
    }
}

struct ControllerShared<T> {
    transport: T,
    config: AcquisitionConfig,
    state: watch::Sender<AcquisitionAttempt>,
    /// Status to fall back to when the poller is cancelled mid-cycle.
    settled: std::sync::Mutex<AttemptStatus>,
    flight: Mutex<()>,
}

impl<T: KeyServiceTransport> ControllerShared<T> {
    fn snapshot(&self) -> AcquisitionAttempt {
        self.state.borrow().clone()
    }

    fn issued_key(&self) -> Option<IssuedKey> {
        let attempt = self.state.borrow();
        (attempt.status == AttemptStatus::Issued)
            .then(|| attempt.key.clone())
            .flatten()
    }

    fn is_issued(&self) -> bool {
        self.state.borrow().status == AttemptStatus::Issued
    }

    fn set_status(&self, status: AttemptStatus) {
        self.state.send_modify(|attempt| attempt.status = status);
    }

    fn begin_request(&self) {
        self.state.send_modify(|attempt| {
            if !is_transient(attempt.status) {
                *self.lock_settled() = attempt.status;
            }
            attempt.status = AttemptStatus::Requesting;
        });
    }

    /// Undoes `Requesting`/`Polling` left behind by an aborted poll task.
    fn settle_cancelled(&self) {
        self.restore_settled(is_transient);
    }

    fn restore_settled(&self, applies: fn(AttemptStatus) -> bool) {
        let settled = *self.lock_settled();
        self.state.send_if_modified(|attempt| {
            if !applies(attempt.status) {
                return false;
            }
            attempt.status = settled;
            true
        });
    }

    fn lock_settled(&self) -> std::sync::MutexGuard<'_, AttemptStatus> {
        self.settled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_issued(&self, key: IssuedKey) {
        self.state.send_modify(|attempt| {
            attempt.status = AttemptStatus::Issued;
            attempt.key = Some(key);
            attempt.last_error = None;
        });
    }

    fn record_gated(&self) {
        self.state.send_modify(|attempt| {
            attempt.status = AttemptStatus::Gated;
            attempt.last_error = None;
        });
    }

    fn record_failure(&self, error: &AcquisitionError) {
        self.state.send_modify(|attempt| {
            attempt.status = AttemptStatus::Failed;
            attempt.last_error = Some(error.to_string());
        });
    }

    async fn call<F>(&self, request: F) -> Result<ServiceReply, AcquisitionError>
    where
        F: Future<Output = Result<ServiceReply, T::Error>>,
    {
        let result = match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, request).await.map_err(|_| {
                AcquisitionError::TimedOut {
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => request.await,
        };
        result.map_err(|error| AcquisitionError::Unreachable {
            message: error.to_string(),
        })
    }

    /// Caller holds `flight`.
    async fn generate(&self, sid: &Sid) -> AttemptResult {
        if let Some(key) = self.issued_key() {
            return AttemptResult::Issued(key);
        }

        self.begin_request();
        let _pending = PendingRequest { shared: self };
        let request = GenerateKeyRequest {
            session_id: sid.to_string(),
            system: self.config.system.clone(),
        };
        debug!(sid = %sid, "requesting access key");

        let reply = match self.call(self.transport.generate_key(&request)).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!(sid = %sid, %error, "key request failed");
                self.record_failure(&error);
                return AttemptResult::Failed(error);
            }
        };

        match interpret_generate_reply(&reply, self.config.gate_signal) {
            GenerateOutcome::Issued {
                key,
                expires_in_hours,
            } => {
                let issued = IssuedKey {
                    key,
                    expires_in_hours,
                    issued_at: Utc::now(),
                };
                info!(sid = %sid, "access key issued");
                self.record_issued(issued.clone());
                AttemptResult::Issued(issued)
            }
            GenerateOutcome::Gated => {
                let redirect = build_ad_redirect(
                    &self.config.ad_link_url,
                    &self.config.ad_target_param,
                    &self.config.verify_url,
                    sid,
                );
                info!(sid = %sid, status = reply.status, "ad gate not satisfied");
                self.record_gated();
                AttemptResult::Gated(redirect)
            }
            GenerateOutcome::Failed(error) => {
                warn!(sid = %sid, status = reply.status, %error, "key request rejected");
                self.record_failure(&error);
                AttemptResult::Failed(error)
            }
        }
    }
}

/// Restores the settled status if a generate request is dropped before it
/// records an outcome.
struct PendingRequest<'a, T: KeyServiceTransport> {
    shared: &'a ControllerShared<T>,
}

impl<T: KeyServiceTransport> Drop for PendingRequest<'_, T> {
    fn drop(&mut self) {
        self.shared
            .restore_settled(|status| status == AttemptStatus::Requesting);
    }
}

fn is_transient(status: AttemptStatus) -> bool {
    matches!(status, AttemptStatus::Requesting | AttemptStatus::Polling)
}

struct PollTask {
    handle: JoinHandle<()>,
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct KeyAcquisitionController<T: KeyServiceTransport + 'static> {
    shared: Arc<ControllerShared<T>>,
    poller: Option<PollTask>,
}

impl<T: KeyServiceTransport + 'static> KeyAcquisitionController<T> {
    pub fn new(transport: T, config: AcquisitionConfig) -> Self {
        let (state, _) = watch::channel(AcquisitionAttempt::default());
        Self {
            shared: Arc::new(ControllerShared {
                transport,
                config,
                state,
                settled: std::sync::Mutex::new(AttemptStatus::Idle),
                flight: Mutex::new(()),
            }),
            poller: None,
        }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn attempt(&self) -> AcquisitionAttempt {
        self.shared.snapshot()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AcquisitionAttempt> {
        self.shared.state.subscribe()
    }

    /// One generate request for `sid`. Once a key is issued this returns it
    /// without touching the network.
    pub async fn request_key(&self, sid: &Sid) -> AttemptResult {
        let _flight = self.shared.flight.lock().await;
        self.shared.generate(sid).await
    }

    /// Forced request outside the poll cadence. The timer keeps its schedule;
    /// a tick that lands while this is in flight is skipped.
    pub async fn recheck(&self, sid: &Sid) -> AttemptResult {
        debug!(sid = %sid, polling = self.is_polling(), "manual key re-check");
        self.request_key(sid).await
    }

    /// Non-mutating "do I already have a key" probe. A valid key moves the
    /// attempt to `Issued`; anything else leaves the status alone.
    pub async fn check_existing(&self, sid: &Sid) -> Result<Option<IssuedKey>, AcquisitionError> {
        let _flight = self.shared.flight.lock().await;
        if let Some(key) = self.shared.issued_key() {
            return Ok(Some(key));
        }

        let request = CheckKeyRequest {
            session_id: sid.to_string(),
        };
        let reply = self
            .shared
            .call(self.shared.transport.check_key(&request))
            .await?;

        match interpret_check_reply(&reply)? {
            KeyCheck::Valid {
                key,
                expires_in_hours,
            } => {
                let issued = IssuedKey {
                    key,
                    expires_in_hours,
                    issued_at: Utc::now(),
                };
                info!(sid = %sid, "existing access key found");
                self.shared.record_issued(issued.clone());
                Ok(Some(issued))
            }
            KeyCheck::Expired => {
                info!(sid = %sid, "existing access key has expired");
                Ok(None)
            }
            KeyCheck::Missing => Ok(None),
        }
    }

    /// Re-invokes the generate request every `interval` until a key is
    /// issued. The first tick fires immediately. Replaces a running poller;
    /// does nothing once a key is issued. Must be called inside a tokio
    /// runtime.
    pub fn start_polling<F>(&mut self, sid: Sid, interval: Duration, on_tick: F)
    where
        F: Fn(&AcquisitionAttempt) + Send + Sync + 'static,
    {
        self.stop_polling();
        if self.shared.is_issued() {
            debug!(sid = %sid, "key already issued; not polling");
            return;
        }

        let interval = interval.max(Duration::from_millis(1));
        self.shared.set_status(AttemptStatus::Polling);
        let shared = Arc::clone(&self.shared);
        debug!(sid = %sid, interval_ms = interval.as_millis() as u64, "starting key poller");
        let handle = tokio::spawn(poll_until_issued(shared, sid, interval, on_tick));
        self.poller = Some(PollTask { handle });
    }

    /// Aborts the poll task. A tick cut off mid-request leaves the attempt
    /// at the status it had before that request started.
    pub fn stop_polling(&mut self) {
        if let Some(task) = self.poller.take() {
            drop(task);
            self.shared.settle_cancelled();
            debug!("key poller stopped");
        }
    }

    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.poller
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Waits until a key is issued, or gives up after `max_wait`.
    pub async fn wait_for_issued(&self, max_wait: Option<Duration>) -> Option<IssuedKey> {
        let mut receiver = self.shared.state.subscribe();
        let wait = async move {
            let key = receiver
                .wait_for(|attempt| attempt.status == AttemptStatus::Issued)
                .await
                .ok()
                .and_then(|attempt| attempt.key.clone());
            key
        };
        match max_wait {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
            None => wait.await,
        }
    }

    /// Leaves for the ad gate. Polling stops and the controller is consumed;
    /// the visitor comes back through the verify page with a new controller.
    pub fn depart<N: Navigator + ?Sized>(mut self, redirect: &AdRedirect, navigator: &N) -> Departure {
        self.stop_polling();
        info!(sid = %redirect.sid, "leaving for ad gate");
        navigator.navigate(&redirect.url);
        Departure {
            url: redirect.url.clone(),
            sid: redirect.sid.clone(),
        }
    }
}

async fn poll_until_issued<T, F>(
    shared: Arc<ControllerShared<T>>,
    sid: Sid,
    interval: Duration,
    on_tick: F,
) where
    T: KeyServiceTransport,
    F: Fn(&AcquisitionAttempt) + Send + Sync,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if shared.is_issued() {
            break;
        }
        let Ok(flight) = shared.flight.try_lock() else {
            debug!(sid = %sid, "key request already in flight; skipping tick");
            continue;
        };
        let result = shared.generate(&sid).await;
        drop(flight);

        on_tick(&shared.snapshot());
        if matches!(result, AttemptResult::Issued(_)) {
            debug!(sid = %sid, "key issued; poller exiting");
            break;
        }
    }
}
