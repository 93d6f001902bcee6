//! Command delivery.
//!
//! The [`CommandEngine`] writes a command payload to a hub, waits for the
//! hub to confirm it and retries with backoff until the attempt budget is
//! spent. It is shared by both controllers and knows nothing about trains
//! or switches beyond what a [`Verification`] tells it.
//!
//! Guarantees:
//! - commands to one hub run strictly one after another, in submission
//!   order; different hubs proceed in parallel
//! - every attempt updates the reliability counters exactly once
//! - verified state is written only after a confirmed delivery
//! - a link loss during an attempt ends the delivery; the command is not
//!   replayed after reconnection

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use railhub_types::{MotorPort, Notification, SwitchPosition};

use crate::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::error::{Error, Result, TransportFailure};
use crate::events::{EventDispatcher, FleetEvent};
use crate::reliability::{ReliabilityBook, ReliabilityStats, StatsKey};
use crate::supervisor::{ConnectionSupervisor, LiveSession};

pub type Predicate = Arc<dyn Fn(&Notification) -> bool + Send + Sync>;

/// How the engine decides an attempt went through.
#[derive(Clone)]
pub enum Verification {
    /// The write itself succeeding is the confirmation.
    WriteAccepted,
    /// Wait for a notification satisfying the predicate.
    Observe(Predicate),
}

impl Verification {
    pub fn observe(predicate: impl Fn(&Notification) -> bool + Send + Sync + 'static) -> Self {
        Self::Observe(Arc::new(predicate))
    }
}

impl fmt::Debug for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteAccepted => write!(f, "WriteAccepted"),
            Self::Observe(_) => write!(f, "Observe(..)"),
        }
    }
}

/// Attempt budget for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Time allowed for write plus verification in a single attempt.
    pub per_attempt_timeout: Duration,
}

impl SendPolicy {
    pub fn new(max_attempts: u32, per_attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            per_attempt_timeout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be at least 1"));
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(Error::invalid_config(
                "per-attempt timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delays between attempts of the same command.
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            backoff: BackoffPolicy::for_commands(),
        }
    }

    #[must_use]
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()
    }
}

/// Device state the engine confirms on behalf of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateSlot {
    SwitchPort(MotorPort),
    TrainPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifiedValue {
    Position(SwitchPosition),
    Power(i8),
}

/// A command on its way to a hub.
#[derive(Debug, Clone)]
pub struct Command {
    pub hub_id: String,
    pub payload: Bytes,
    pub correlation: u64,
    pub issued_at: Instant,
    pub retries_left: u32,
    pub stats_key: StatsKey,
    pub confirms: Option<(StateSlot, VerifiedValue)>,
    pub label: &'static str,
}

impl Command {
    #[must_use]
    pub fn stats_key(mut self, key: StatsKey) -> Self {
        self.stats_key = key;
        self
    }

    /// State to record as verified once the command is confirmed.
    #[must_use]
    pub fn confirms(mut self, slot: StateSlot, value: VerifiedValue) -> Self {
        self.confirms = Some((slot, value));
        self
    }

    #[must_use]
    pub fn label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Transport(TransportFailure),
    VerificationTimeout,
    /// A reset or shutdown interrupted the delivery.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(reason) => write!(f, "transport: {reason}"),
            Self::VerificationTimeout => write!(f, "not confirmed in time"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Confirmed {
        attempts: u32,
        /// The notification that confirmed the command, if one was awaited.
        evidence: Option<Notification>,
    },
    Failed {
        attempts: u32,
        reason: FailureReason,
    },
}

impl DeliveryOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Confirmed { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn evidence(&self) -> Option<&Notification> {
        match self {
            Self::Confirmed { evidence, .. } => evidence.as_ref(),
            Self::Failed { .. } => None,
        }
    }
}

enum AttemptError {
    /// Worth another attempt.
    Retryable(FailureReason),
    /// The session went away mid-attempt.
    LinkLost,
}

fn transport_reason(error: Error) -> TransportFailure {
    match error {
        Error::Transport { reason, .. } => reason,
        Error::NotConnected => TransportFailure::NotConnected,
        other => TransportFailure::WriteFailed(other.to_string()),
    }
}

pub struct CommandEngine {
    supervisor: Arc<ConnectionSupervisor>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    events: EventDispatcher,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    verified: RwLock<HashMap<(String, StateSlot), VerifiedValue>>,
    reliability: ReliabilityBook,
    next_correlation: AtomicU64,
}

impl CommandEngine {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        events: EventDispatcher,
    ) -> Self {
        Self {
            supervisor,
            clock,
            config,
            events,
            lanes: Mutex::new(HashMap::new()),
            verified: RwLock::new(HashMap::new()),
            reliability: ReliabilityBook::new(),
            next_correlation: AtomicU64::new(1),
        }
    }

    /// Start a command for `hub_id` with a fresh correlation id.
    pub fn command(&self, hub_id: &str, payload: Bytes) -> Command {
        Command {
            hub_id: hub_id.to_string(),
            payload,
            correlation: self.next_correlation.fetch_add(1, Ordering::Relaxed),
            issued_at: self.clock.now(),
            retries_left: 0,
            stats_key: StatsKey::hub(hub_id),
            confirms: None,
            label: "command",
        }
    }

    fn lane(&self, hub_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(lanes.entry(hub_id.to_string()).or_default())
    }

    /// Deliver `command`, retrying per `policy`.
    ///
    /// Waits for earlier commands to the same hub first. Failures are
    /// returned as [`DeliveryOutcome::Failed`], never as errors.
    #[tracing::instrument(
        level = "debug",
        skip(self, command, verify, policy),
        fields(hub_id = %command.hub_id, correlation = command.correlation, label = command.label)
    )]
    pub async fn send(
        &self,
        mut command: Command,
        verify: Verification,
        policy: SendPolicy,
    ) -> DeliveryOutcome {
        let lane = self.lane(&command.hub_id);
        let _turn = lane.lock().await;

        let Some(cancel) = self.supervisor.cancellation(&command.hub_id).await else {
            return self.finish(
                &command,
                DeliveryOutcome::Failed {
                    attempts: 0,
                    reason: FailureReason::Transport(TransportFailure::NotConnected),
                },
            );
        };

        let max_attempts = policy.max_attempts.max(1);
        command.retries_left = max_attempts;
        let mut backoff = self.config.backoff.backoff();
        let mut attempts = 0;

        loop {
            attempts += 1;
            command.retries_left -= 1;
            let started = self.clock.now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AttemptError::Retryable(FailureReason::Cancelled)),
                r = self.attempt(&command, &verify, policy.per_attempt_timeout) => r,
            };
            let latency = self.clock.now().saturating_duration_since(started);

            let reason = match result {
                Ok(evidence) => {
                    self.record(&command.stats_key, true, latency);
                    if let Some((slot, value)) = command.confirms {
                        self.set_verified(&command.hub_id, slot, value);
                    }
                    debug!(attempt = attempts, ?latency, "Command confirmed");
                    return self.finish(&command, DeliveryOutcome::Confirmed { attempts, evidence });
                }
                Err(AttemptError::LinkLost) => {
                    self.record(&command.stats_key, false, latency);
                    warn!(attempt = attempts, "Link lost during command, not retrying");
                    return self.finish(
                        &command,
                        DeliveryOutcome::Failed {
                            attempts,
                            reason: FailureReason::Transport(TransportFailure::LinkLost),
                        },
                    );
                }
                Err(AttemptError::Retryable(reason)) => {
                    self.record(&command.stats_key, false, latency);
                    reason
                }
            };

            if reason == FailureReason::Cancelled || command.retries_left == 0 {
                warn!(attempts, %reason, "Command failed");
                return self.finish(&command, DeliveryOutcome::Failed { attempts, reason });
            }

            let delay = backoff.next_delay();
            debug!(attempt = attempts, %reason, ?delay, "Attempt failed, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.finish(
                        &command,
                        DeliveryOutcome::Failed { attempts, reason: FailureReason::Cancelled },
                    );
                }
                _ = self.clock.sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        command: &Command,
        verify: &Verification,
        timeout: Duration,
    ) -> std::result::Result<Option<Notification>, AttemptError> {
        let not_connected = AttemptError::Retryable(FailureReason::Transport(
            TransportFailure::NotConnected,
        ));
        let Some(live) = self.supervisor.session(&command.hub_id).await else {
            return Err(not_connected);
        };
        if live.is_lost() {
            return Err(not_connected);
        }

        // subscribe before writing so a fast reply is not missed
        let mut feedback = match verify {
            Verification::WriteAccepted => None,
            Verification::Observe(_) => Some(
                self.supervisor
                    .subscribe(&command.hub_id)
                    .await
                    .ok_or(not_connected)?,
            ),
        };

        // one deadline covers the write and the wait for confirmation
        let mut deadline = self.clock.sleep(timeout);
        let written = tokio::select! {
            biased;
            _ = live.lost() => return Err(AttemptError::LinkLost),
            r = live.session.write(&command.payload) => Some(r),
            _ = &mut deadline => None,
        };
        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.write_failed(&live, transport_reason(e)).await),
            None => {
                return Err(self
                    .write_failed(&live, TransportFailure::WriteTimeout(timeout))
                    .await);
            }
        }

        let (Verification::Observe(predicate), Some(feedback)) = (verify, feedback.as_mut()) else {
            return Ok(None);
        };
        loop {
            let received = tokio::select! {
                biased;
                _ = live.lost() => return Err(AttemptError::LinkLost),
                r = feedback.recv() => r,
                _ = &mut deadline => {
                    return Err(AttemptError::Retryable(FailureReason::VerificationTimeout));
                }
            };
            match received {
                Ok(notification) => {
                    if predicate(&notification) {
                        return Ok(Some(notification));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Verification fell behind the notification stream");
                }
                Err(RecvError::Closed) => {
                    return Err(AttemptError::Retryable(FailureReason::Transport(
                        TransportFailure::NotConnected,
                    )));
                }
            }
        }
    }

    /// A failed write on a session that no longer reports connected is a
    /// link loss; otherwise it is worth retrying.
    async fn write_failed(&self, live: &LiveSession, reason: TransportFailure) -> AttemptError {
        if live.session.is_connected().await {
            AttemptError::Retryable(FailureReason::Transport(reason))
        } else {
            info!(hub_id = live.session.hub_id(), %reason, "Write failed on a closed session");
            live.mark_lost();
            AttemptError::LinkLost
        }
    }

    fn record(&self, key: &StatsKey, success: bool, latency: Duration) {
        let keys = match key.port {
            Some(_) => vec![key.clone(), StatsKey::hub(key.hub_id.clone())],
            None => vec![key.clone()],
        };
        for key in &keys {
            if success {
                self.reliability.record_success(key, latency);
            } else {
                self.reliability.record_failure(key, latency);
            }
        }
    }

    fn finish(&self, command: &Command, outcome: DeliveryOutcome) -> DeliveryOutcome {
        self.events.send(FleetEvent::CommandFinished {
            hub_id: command.hub_id.clone(),
            correlation: command.correlation,
            attempts: outcome.attempts(),
            confirmed: outcome.is_confirmed(),
        });
        outcome
    }

    fn set_verified(&self, hub_id: &str, slot: StateSlot, value: VerifiedValue) {
        self.verified
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((hub_id.to_string(), slot), value);
    }

    fn verified(&self, hub_id: &str, slot: StateSlot) -> Option<VerifiedValue> {
        self.verified
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(hub_id.to_string(), slot))
            .copied()
    }

    /// Last confirmed position of a switch port.
    pub fn verified_position(&self, hub_id: &str, port: MotorPort) -> Option<SwitchPosition> {
        match self.verified(hub_id, StateSlot::SwitchPort(port)) {
            Some(VerifiedValue::Position(position)) => Some(position),
            _ => None,
        }
    }

    /// Last power a train hub accepted.
    pub fn verified_power(&self, hub_id: &str) -> Option<i8> {
        match self.verified(hub_id, StateSlot::TrainPower) {
            Some(VerifiedValue::Power(power)) => Some(power),
            _ => None,
        }
    }

    pub fn stats(&self, key: &StatsKey) -> ReliabilityStats {
        self.reliability.get(key)
    }

    /// Forget counters and verified state of one hub.
    pub fn clear_hub(&self, hub_id: &str) {
        self.reliability.clear_hub(hub_id);
        self.verified
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _), _| id != hub_id);
    }

    pub fn clear_all(&self) {
        self.reliability.clear_all();
        self.verified.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ManualClock, MockHub};
    use crate::testing::{rig, rig_with_clock};
    use railhub_types::{HubRole, wire};

    fn status_reply() -> Bytes {
        wire::encode_tuple(&[1.into(), 11.into(), 0b1000.into(), 0b1000.into()])
    }

    fn a_is_diverging() -> Verification {
        Verification::observe(|n| {
            matches!(n, Notification::Switch(s)
                if s.position(MotorPort::A) == Some(SwitchPosition::Diverging))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_accepted_confirms_first_attempt() {
        let hub = MockHub::new("train-1", HubRole::Train);
        let rig = rig(&[&hub]).await;

        let command = rig
            .engine
            .command("train-1", wire::encode_int8(40))
            .confirms(StateSlot::TrainPower, VerifiedValue::Power(40));
        let outcome = rig
            .engine
            .send(command, Verification::WriteAccepted, SendPolicy::default())
            .await;

        assert_eq!(outcome, DeliveryOutcome::Confirmed { attempts: 1, evidence: None });
        assert_eq!(rig.engine.verified_power("train-1"), Some(40));
        assert_eq!(hub.writes().len(), 1);
        rig.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_reply_confirms() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        hub.on_write(|_| vec![status_reply()]);
        let rig = rig(&[&hub]).await;

        let key = StatsKey::port("sw-1", MotorPort::A);
        let command = rig
            .engine
            .command("sw-1", wire::encode_int16(1001))
            .stats_key(key.clone())
            .confirms(
                StateSlot::SwitchPort(MotorPort::A),
                VerifiedValue::Position(SwitchPosition::Diverging),
            );
        let outcome = rig.engine.send(command, a_is_diverging(), SendPolicy::default()).await;

        assert!(outcome.is_confirmed());
        assert!(matches!(outcome.evidence(), Some(Notification::Switch(_))));
        assert_eq!(
            rig.engine.verified_position("sw-1", MotorPort::A),
            Some(SwitchPosition::Diverging)
        );
        let stats = rig.engine.stats(&key);
        assert_eq!((stats.attempts, stats.successes, stats.failures), (1, 1, 0));
        assert_eq!(rig.engine.stats(&StatsKey::hub("sw-1")).attempts, 1);
        rig.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_command_exhausts_budget() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let rig = rig(&[&hub]).await;

        let key = StatsKey::port("sw-1", MotorPort::A);
        let command = rig
            .engine
            .command("sw-1", wire::encode_int16(1001))
            .stats_key(key.clone())
            .confirms(
                StateSlot::SwitchPort(MotorPort::A),
                VerifiedValue::Position(SwitchPosition::Diverging),
            );
        let outcome = rig.engine.send(command, a_is_diverging(), SendPolicy::default()).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Failed {
                attempts: 3,
                reason: FailureReason::VerificationTimeout
            }
        );
        assert_eq!(rig.engine.verified_position("sw-1", MotorPort::A), None);
        let stats = rig.engine.stats(&key);
        assert_eq!((stats.attempts, stats.failures, stats.consecutive_failures), (3, 3, 3));
        assert_eq!(hub.writes().len(), 3);
        rig.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_deadline_follows_injected_clock() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let clock = Arc::new(ManualClock::new());
        let rig = rig_with_clock(&[&hub], clock.clone()).await;

        let key = StatsKey::port("sw-1", MotorPort::A);
        let command = rig
            .engine
            .command("sw-1", wire::encode_int16(1001))
            .stats_key(key.clone());
        let policy = SendPolicy::new(2, Duration::from_millis(500));
        let outcome = rig.engine.send(command, a_is_diverging(), policy).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Failed {
                attempts: 2,
                reason: FailureReason::VerificationTimeout
            }
        );
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(500),
                Duration::from_millis(100),
                Duration::from_millis(500)
            ]
        );
        let stats = rig.engine.stats(&key);
        assert_eq!(stats.avg_latency_ms(), Some(500.0));
        assert_eq!(stats.max_latency_ms, Some(500));
        rig.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_failure_is_retried() {
        let hub = MockHub::new("train-1", HubRole::Train);
        let rig = rig(&[&hub]).await;
        hub.fail_next_writes(1);

        let command = rig.engine.command("train-1", wire::encode_int8(10));
        let outcome = rig
            .engine
            .send(command, Verification::WriteAccepted, SendPolicy::default())
            .await;

        assert_eq!(outcome.attempts(), 2);
        assert!(outcome.is_confirmed());
        let stats = rig.engine.stats(&StatsKey::hub("train-1"));
        assert_eq!((stats.attempts, stats.successes, stats.failures), (2, 1, 1));
        rig.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_aborts_without_replay() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let rig = rig(&[&hub]).await;
        hub.drop_link_on_next_write();

        let command = rig.engine.command("sw-1", wire::encode_int16(2000));
        let outcome = rig.engine.send(command, a_is_diverging(), SendPolicy::default()).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Failed {
                attempts: 1,
                reason: FailureReason::Transport(TransportFailure::LinkLost)
            }
        );
        hub.wait_for_connects(2).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(hub.writes().is_empty());
        rig.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_to_one_hub_do_not_interleave() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let rig = rig(&[&hub]).await;
        let policy = SendPolicy::new(2, Duration::from_millis(200));

        let first = rig.engine.command("sw-1", wire::encode_int16(1001));
        let second = rig.engine.command("sw-1", wire::encode_int16(2001));
        let (a, b) = tokio::join!(
            rig.engine.send(first, a_is_diverging(), policy),
            rig.engine.send(second, a_is_diverging(), policy),
        );
        assert!(!a.is_confirmed() && !b.is_confirmed());

        let writes = hub.writes();
        let codes: Vec<_> = writes.iter().map(|w| w[2]).collect();
        // 1001 = 0x03e9, 2001 = 0x07d1
        assert_eq!(codes, vec![0xe9, 0xe9, 0xd1, 0xd1]);
        rig.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_in_flight_command() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let rig = rig(&[&hub]).await;
        let engine = Arc::clone(&rig.engine);

        let command = engine.command("sw-1", wire::encode_int16(1001));
        let pending = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.send(command, a_is_diverging(), SendPolicy::default()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        rig.supervisor.reset(Some("sw-1")).await.unwrap();

        let outcome = pending.await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed { reason: FailureReason::Cancelled, .. }
        ));
        rig.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_hub_fails_without_attempts() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let rig = rig(&[&hub]).await;
        let command = rig.engine.command("ghost", wire::encode_int16(1001));
        let outcome = rig
            .engine
            .send(command, Verification::WriteAccepted, SendPolicy::default())
            .await;
        assert_eq!(outcome.attempts(), 0);
        assert_eq!(rig.engine.stats(&StatsKey::hub("ghost")).attempts, 0);
        rig.supervisor.shutdown().await;
    }

    #[test]
    fn test_send_policy_validation() {
        assert!(SendPolicy::default().validate().is_ok());
        assert!(SendPolicy::new(0, Duration::from_secs(1)).validate().is_err());
    }
}
