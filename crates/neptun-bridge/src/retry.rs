//! Command retry supervisor
//!
//! One task owns every in-flight retry sequence, keyed by (device, field),
//! and sleeps until the earliest deadline. A sequence is:
//!
//! ```text
//! issue ──► send #1, deadline = now + spacing
//!   tick ──► confirmed value == desired      → Confirmed
//!        ──► destination no longer resolves  → Exhausted(DestinationUnknown)
//!        ──► attempts < max                  → resend, rebuilt from current state
//!        ──► otherwise                       → Exhausted(ConvergenceTimeout)
//! ```
//!
//! A resend is recomposed from the device's effective snapshot with every
//! pending settings change of that device reapplied in issue order, so
//! resending one field never reverts another field's in-flight value.
//!
//! A second command for the same key ends the first as
//! `Exhausted(Superseded)`; a superseding counter write also takes over the
//! earlier write's lines it does not itself touch. Commands without an
//! expectation (clock set) are sent once and not tracked. Sends only ever
//! happen inside the supervisor, so a finished sequence can never produce a
//! late send.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::Frame;
use crate::composer::{CommandComposer, ComposedCommand, PendingChange};
use crate::config::RetryConfig;
use crate::error::{NeptunError, Result};
use crate::registry::{DeviceId, Field, FieldValue};

const COMMAND_QUEUE_SIZE: usize = 256;
const OUTCOME_BUFFER: usize = 256;

/// Why a sequence ended without convergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    /// Every attempt was sent and the device never reported the value
    ConvergenceTimeout,
    /// The device's destination stopped resolving
    DestinationUnknown,
    /// A newer command for the same field replaced this one
    Superseded,
}

/// Terminal state of a retry sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Telemetry reported the desired value
    Confirmed,
    /// Gave up
    Exhausted(ExhaustReason),
}

impl RetryOutcome {
    /// Payload published on the result topic
    pub fn label(&self) -> &'static str {
        match self {
            RetryOutcome::Confirmed => "confirmed",
            RetryOutcome::Exhausted(ExhaustReason::ConvergenceTimeout) => "timeout",
            RetryOutcome::Exhausted(ExhaustReason::DestinationUnknown) => "destination_unknown",
            RetryOutcome::Exhausted(ExhaustReason::Superseded) => "superseded",
        }
    }
}

impl fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of one sequence, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    /// Device the command targeted
    pub device: DeviceId,
    /// Field the command drove
    pub field: Field,
    /// How it ended
    pub outcome: RetryOutcome,
    /// Sends made, failed ones included
    pub attempts: u32,
}

/// A frame handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Target device
    pub device: DeviceId,
    /// Outbound channel
    pub destination: String,
    /// Encoded command
    pub frame: Frame,
}

/// Send primitive supplied by the transport; only success or failure matters
pub type SendCallback = Arc<dyn Fn(Outbound) -> std::result::Result<(), String> + Send + Sync>;

/// Supervisor statistics
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Commands accepted
    pub issued: u64,
    /// Frames handed to the send primitive
    pub sends: u64,
    /// Sends the primitive reported as failed
    pub send_failures: u64,
    /// Sequences confirmed
    pub confirmed: u64,
    /// Sequences exhausted by timeout
    pub timeouts: u64,
    /// Sequences aborted for lack of destination
    pub destination_lost: u64,
    /// Sequences replaced by a newer command
    pub superseded: u64,
    /// Commands sent once without tracking
    pub fire_and_forget: u64,
}

type RetryKey = (DeviceId, Field);

#[derive(Debug)]
struct RetryState {
    change: PendingChange,
    seq: u64,
    desired: FieldValue,
    attempts: u32,
    deadline: Instant,
}

/// Requests accepted by the supervisor task
#[derive(Debug)]
pub enum RetryCommand {
    /// Start a sequence for a composed command
    Issue(ComposedCommand),
    /// Get supervisor statistics
    GetStats(oneshot::Sender<RetryStats>),
    /// Stop the supervisor
    Shutdown,
}

/// Handle for feeding the supervisor
#[derive(Clone)]
pub struct RetryHandle {
    command_tx: mpsc::Sender<RetryCommand>,
    outcome_tx: broadcast::Sender<RetryReport>,
}

impl RetryHandle {
    /// Queue a command, waiting for queue space
    pub async fn issue(&self, command: ComposedCommand) -> Result<()> {
        self.command_tx
            .send(RetryCommand::Issue(command))
            .await
            .map_err(|_| NeptunError::ChannelClosed)
    }

    /// Queue a command without waiting
    pub fn try_issue(&self, command: ComposedCommand) -> Result<()> {
        self.command_tx
            .try_send(RetryCommand::Issue(command))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    NeptunError::ChannelError("retry queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => NeptunError::ChannelClosed,
            })
    }

    /// Receive every outcome from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RetryReport> {
        self.outcome_tx.subscribe()
    }

    /// Get supervisor statistics
    pub async fn stats(&self) -> Result<RetryStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RetryCommand::GetStats(tx))
            .await
            .map_err(|_| NeptunError::ChannelClosed)?;
        rx.await.map_err(|_| NeptunError::ChannelClosed)
    }

    /// Stop the supervisor; pending sequences are dropped without an outcome
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(RetryCommand::Shutdown)
            .await
            .map_err(|_| NeptunError::ChannelClosed)
    }
}

/// Owner of every retry sequence
pub struct RetrySupervisor {
    composer: CommandComposer,
    send: SendCallback,
    max_attempts: u32,
    spacing: Duration,
    pending: HashMap<RetryKey, RetryState>,
    next_seq: u64,
    command_rx: mpsc::Receiver<RetryCommand>,
    outcome_tx: broadcast::Sender<RetryReport>,
    stats: RetryStats,
}

impl RetrySupervisor {
    /// Create a supervisor and its handle
    pub fn new(
        composer: CommandComposer,
        config: &RetryConfig,
        send: SendCallback,
    ) -> (Self, RetryHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (outcome_tx, _) = broadcast::channel(OUTCOME_BUFFER);
        let handle = RetryHandle {
            command_tx,
            outcome_tx: outcome_tx.clone(),
        };

        let supervisor = Self {
            composer,
            send,
            max_attempts: config.max_attempts.max(1),
            spacing: config.spacing,
            pending: HashMap::new(),
            next_seq: 0,
            command_rx,
            outcome_tx,
            stats: RetryStats::default(),
        };
        (supervisor, handle)
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Retry supervisor started: {} attempts, {:?} spacing",
            self.max_attempts, self.spacing
        );

        loop {
            let next = self.next_deadline();
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(RetryCommand::Issue(command)) => {
                            self.issue_at(command, Instant::now());
                        }
                        Some(RetryCommand::GetStats(tx)) => {
                            let _ = tx.send(self.stats.clone());
                        }
                        Some(RetryCommand::Shutdown) | None => break,
                    }
                }
                _ = sleep_until(next) => {
                    self.process_due(Instant::now());
                }
            }
        }

        info!(
            pending = self.pending.len(),
            "Retry supervisor stopped"
        );
    }

    /// Start a sequence as of `now`
    pub fn issue_at(&mut self, command: ComposedCommand, now: Instant) {
        self.stats.issued += 1;
        let ComposedCommand {
            device,
            destination,
            frame,
            expectation,
            change,
            ..
        } = command;

        let (Some((field, desired)), Some(change)) = (expectation, change) else {
            self.stats.fire_and_forget += 1;
            self.send_frame(&device, destination, &frame);
            return;
        };

        let key = (device, field);
        let (desired, change) = match self.pending.remove(&key) {
            Some(old) => {
                debug!(device = %key.0, field = %key.1, "Superseding retry sequence");
                self.finish(&key, RetryOutcome::Exhausted(ExhaustReason::Superseded), old.attempts);
                carry_forward(old, desired, change)
            }
            None => (desired, change),
        };

        self.send_frame(&key.0, destination, &frame);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            key,
            RetryState {
                change,
                seq,
                desired,
                attempts: 1,
                deadline: now + self.spacing,
            },
        );
    }

    /// Advance every sequence whose deadline is at or before `now`
    pub fn process_due(&mut self, now: Instant) {
        let due: Vec<RetryKey> = self
            .pending
            .iter()
            .filter(|(_, state)| state.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            self.tick(key, now);
        }
    }

    fn tick(&mut self, key: RetryKey, now: Instant) {
        let Some(mut state) = self.pending.remove(&key) else {
            return;
        };
        let (device, field) = &key;

        if self
            .composer
            .registry()
            .is_converged(device, *field, &state.desired)
        {
            self.finish(&key, RetryOutcome::Confirmed, state.attempts);
            return;
        }

        let destination = match self.composer.resolve_destination(device) {
            Ok(destination) => destination,
            Err(_) => {
                self.finish(
                    &key,
                    RetryOutcome::Exhausted(ExhaustReason::DestinationUnknown),
                    state.attempts,
                );
                return;
            }
        };

        if state.attempts >= self.max_attempts {
            self.finish(
                &key,
                RetryOutcome::Exhausted(ExhaustReason::ConvergenceTimeout),
                state.attempts,
            );
            return;
        }

        trace!(device = %device, field = %field, attempt = state.attempts + 1, "Resending command");
        match self.rebuild_frame(device, &state) {
            Ok(frame) => self.send_frame(device, destination, &frame),
            Err(e) => {
                warn!(device = %device, field = %field, "Could not rebuild command: {}", e);
                self.stats.send_failures += 1;
            }
        }
        state.attempts += 1;
        state.deadline = now + self.spacing;
        self.pending.insert(key, state);
    }

    /// Frame for resending `state`; the sequence itself is already out of `pending`
    fn rebuild_frame(&self, device: &DeviceId, state: &RetryState) -> Result<Frame> {
        let mut changes: Vec<(u64, &PendingChange)> = match state.change {
            PendingChange::Settings(_) => self
                .pending
                .iter()
                .filter(|((other, _), s)| {
                    other == device && matches!(s.change, PendingChange::Settings(_))
                })
                .map(|(_, s)| (s.seq, &s.change))
                .collect(),
            PendingChange::Counters(_) => Vec::new(),
        };
        changes.push((state.seq, &state.change));
        changes.sort_by_key(|(seq, _)| *seq);
        self.composer
            .rebuild(device, changes.into_iter().map(|(_, change)| change))
    }

    fn send_frame(&mut self, device: &DeviceId, destination: String, frame: &Frame) {
        self.stats.sends += 1;
        let outbound = Outbound {
            device: device.clone(),
            destination,
            frame: frame.clone(),
        };
        if let Err(e) = (self.send)(outbound) {
            debug!(device = %device, "Command send failed: {}", e);
            self.stats.send_failures += 1;
        }
    }

    fn finish(&mut self, key: &RetryKey, outcome: RetryOutcome, attempts: u32) {
        let (device, field) = key;
        match outcome {
            RetryOutcome::Confirmed => {
                self.stats.confirmed += 1;
                debug!(device = %device, field = %field, attempts, "Command confirmed");
            }
            RetryOutcome::Exhausted(ExhaustReason::ConvergenceTimeout) => {
                self.stats.timeouts += 1;
                warn!(device = %device, field = %field, attempts, "Device did not confirm command");
            }
            RetryOutcome::Exhausted(ExhaustReason::DestinationUnknown) => {
                self.stats.destination_lost += 1;
                warn!(device = %device, field = %field, "Destination lost, retry aborted");
            }
            RetryOutcome::Exhausted(ExhaustReason::Superseded) => {
                self.stats.superseded += 1;
            }
        }

        // No subscribers is fine
        let _ = self.outcome_tx.send(RetryReport {
            device: device.clone(),
            field: *field,
            outcome,
            attempts,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|state| state.deadline).min()
    }

    /// Number of sequences in flight
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check whether a sequence is in flight for this key
    pub fn is_pending(&self, device: &DeviceId, field: Field) -> bool {
        self.pending.contains_key(&(device.clone(), field))
    }

    /// Get supervisor statistics
    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }
}

/// Desired value and change for a sequence replacing `old` on the same key
///
/// Counter writes merge: lines the newer write leaves alone keep the older
/// write's target. Everything else is simply replaced.
fn carry_forward(
    old: RetryState,
    desired: FieldValue,
    change: PendingChange,
) -> (FieldValue, PendingChange) {
    match (old.desired, old.change, desired, change) {
        (
            FieldValue::Counters(old_lines),
            PendingChange::Counters(old_updates),
            FieldValue::Counters(new_lines),
            PendingChange::Counters(new_updates),
        ) => {
            let mut lines: Vec<_> = old_lines
                .into_iter()
                .filter(|(line, _)| new_lines.iter().all(|(l, _)| l != line))
                .collect();
            lines.extend(new_lines);
            let mut updates = old_updates;
            updates.extend(new_updates);
            (FieldValue::Counters(lines), PendingChange::Counters(updates))
        }
        (_, _, desired, change) => (desired, change),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
