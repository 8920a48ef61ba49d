use crate::admin;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::rpc::SettlementRpc;
use crate::signer::Signer;
use crate::store::StatePersister;
use crate::types::{CoreState, Opcode, SharedState, SubId, SubStatus, Subscription};
use crate::webhook::{self, EventEnvelope, WebhookSink};
use futures::StreamExt;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicI64, Ordering},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Notify;

/// Consecutive unsuccessful payment ticks before a subscription is
/// auto-paused and requires operator intervention.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Backoff cap multiplier: the k-th retry waits at most `base * MAX_MULT`.
const MAX_BACKOFF_MULT: u64 = 16;

/// Retry interval when dispatch is refused because the cycle balance fell
/// below the floor.
const CYCLE_STARVED_RETRY_SECS: i64 = 600;

/// Sleep bound while no timers are armed.
const IDLE_HEARTBEAT_SECS: u64 = 60;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

/// Time source. The daemon uses the system clock; tests drive literal
/// timestamps through `ManualClock`.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        now_unix()
    }
}

pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Exponential backoff with the base derived from the subscription period:
/// retries stay responsive for short intervals without hot-looping against a
/// broken chain for long ones.
pub fn backoff_delay_seconds(interval_seconds: u64, consecutive_failures: u32) -> u64 {
    let base = (interval_seconds / 16).clamp(60, 3_600);
    let exp = consecutive_failures.saturating_sub(1);
    let mult = if exp >= 4 {
        MAX_BACKOFF_MULT
    } else {
        1u64 << exp
    };
    base.saturating_mul(mult)
}

/// Fire time for the k-th retry. Never past the next period boundary; a
/// retry that would overshoot is reset to the boundary itself.
pub fn retry_fire_at(
    now: i64,
    next_execution_at: i64,
    interval_seconds: u64,
    consecutive_failures: u32,
) -> i64 {
    let delay = backoff_delay_seconds(interval_seconds, consecutive_failures) as i64;
    let boundary = next_execution_at.saturating_add(interval_seconds as i64);
    now.saturating_add(delay).min(boundary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    Payment,
    Reminder,
}

#[derive(Debug, Default, Clone, Copy)]
struct ArmedTimers {
    payment: Option<i64>,
    reminder: Option<i64>,
}

/// Pending timers ordered by `(fire_at, sub_id)`. At most one payment and
/// one reminder timer per subscription; arming a kind replaces its
/// predecessor.
#[derive(Debug, Default)]
pub struct TimerWheel {
    queue: BTreeSet<(i64, SubId, TimerKind)>,
    armed: BTreeMap<SubId, ArmedTimers>,
}

impl TimerWheel {
    pub fn arm(&mut self, sub_id: &str, kind: TimerKind, fire_at: i64) {
        let entry = self.armed.entry(sub_id.to_string()).or_default();
        let slot = match kind {
            TimerKind::Payment => &mut entry.payment,
            TimerKind::Reminder => &mut entry.reminder,
        };
        if let Some(prev) = slot.replace(fire_at) {
            self.queue.remove(&(prev, sub_id.to_string(), kind));
        }
        self.queue.insert((fire_at, sub_id.to_string(), kind));
    }

    pub fn cancel_all(&mut self, sub_id: &str) {
        if let Some(armed) = self.armed.remove(sub_id) {
            if let Some(t) = armed.payment {
                self.queue.remove(&(t, sub_id.to_string(), TimerKind::Payment));
            }
            if let Some(t) = armed.reminder {
                self.queue.remove(&(t, sub_id.to_string(), TimerKind::Reminder));
            }
        }
    }

    pub fn is_armed(&self, sub_id: &str, kind: TimerKind) -> bool {
        self.armed
            .get(sub_id)
            .map(|a| match kind {
                TimerKind::Payment => a.payment.is_some(),
                TimerKind::Reminder => a.reminder.is_some(),
            })
            .unwrap_or(false)
    }

    pub fn armed_for(&self, sub_id: &str) -> usize {
        self.armed
            .get(sub_id)
            .map(|a| usize::from(a.payment.is_some()) + usize::from(a.reminder.is_some()))
            .unwrap_or(0)
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.queue.iter().next().map(|(t, _, _)| *t)
    }

    /// Remove and return every timer with `fire_at <= now`, in fire order.
    pub fn pop_due(&mut self, now: i64) -> Vec<(SubId, TimerKind)> {
        let mut due = Vec::new();
        while let Some((fire_at, sub_id, kind)) = self.queue.iter().next().cloned() {
            if fire_at > now {
                break;
            }
            self.queue.remove(&(fire_at, sub_id.clone(), kind));
            if let Some(armed) = self.armed.get_mut(&sub_id) {
                match kind {
                    TimerKind::Payment => armed.payment = None,
                    TimerKind::Reminder => armed.reminder = None,
                }
                if armed.payment.is_none() && armed.reminder.is_none() {
                    self.armed.remove(&sub_id);
                }
            }
            due.push((sub_id, kind));
        }
        due
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Default)]
struct InFlight {
    dispatching: BTreeSet<SubId>,
    /// Fires that arrived while the same subscription was mid-dispatch.
    /// Examined when the dispatch completes.
    queued: BTreeMap<SubId, (TimerKind, i64)>,
}

/// Timer engine. Owns the wheel and the in-flight set; fires due ticks
/// through the dispatcher and applies classified outcomes to the store.
pub struct Scheduler<R, S> {
    state: SharedState,
    dispatcher: Dispatcher<R, S>,
    timers: StdMutex<TimerWheel>,
    in_flight: StdMutex<InFlight>,
    persister: Arc<StatePersister>,
    webhook: Option<Arc<WebhookSink>>,
    clock: Arc<dyn Clock>,
    wake: Notify,
    max_concurrency: usize,
    dispatch_cost_cycles: u64,
    auto_refill_amount: u64,
    dry_run: bool,
}

impl<R: SettlementRpc, S: Signer> Scheduler<R, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedState,
        dispatcher: Dispatcher<R, S>,
        persister: Arc<StatePersister>,
        webhook: Option<Arc<WebhookSink>>,
        clock: Arc<dyn Clock>,
        max_concurrency: usize,
        dispatch_cost_cycles: u64,
        auto_refill_amount: u64,
        dry_run: bool,
    ) -> Self {
        Self {
            state,
            dispatcher,
            timers: StdMutex::new(TimerWheel::default()),
            in_flight: StdMutex::new(InFlight::default()),
            persister,
            webhook,
            clock,
            wake: Notify::new(),
            max_concurrency: max_concurrency.max(1),
            dispatch_cost_cycles,
            auto_refill_amount,
            dry_run,
        }
    }

    pub fn arm_payment(&self, sub_id: &str, fire_at: i64) {
        self.timers
            .lock()
            .expect("timer wheel lock poisoned")
            .arm(sub_id, TimerKind::Payment, fire_at);
        self.wake.notify_one();
    }

    pub fn arm_reminder(&self, sub_id: &str, fire_at: i64) {
        self.timers
            .lock()
            .expect("timer wheel lock poisoned")
            .arm(sub_id, TimerKind::Reminder, fire_at);
        self.wake.notify_one();
    }

    /// Cancel both timers and any coalesced fire. Pairs with the mid-flight
    /// re-read in `apply_payment_outcome` to make cancellation atomic from
    /// the caller's point of view.
    pub fn cancel_timers(&self, sub_id: &str) {
        self.timers
            .lock()
            .expect("timer wheel lock poisoned")
            .cancel_all(sub_id);
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .queued
            .remove(sub_id);
        self.wake.notify_one();
    }

    /// Arm timers for one Active subscription. Overdue payments are armed at
    /// their stored (past) fire time and will be picked up by the next
    /// `process_due`; reminders are only armed while still in the future.
    pub fn arm_for_subscription(&self, sub: &Subscription, now: i64) {
        if sub.status != SubStatus::Active {
            return;
        }
        self.arm_payment(&sub.sub_id, sub.next_execution_at);
        if let Some(reminder_at) = sub.reminder_at() {
            if reminder_at > now {
                self.arm_reminder(&sub.sub_id, reminder_at);
            }
        }
    }

    /// Boot-time rearm: timers are ephemeral, the store is authoritative.
    /// Runs before any externally triggered operation is serviced.
    pub async fn rearm_from_store(&self, now: i64) -> usize {
        let core = self.state.lock().await;
        let mut armed = 0usize;
        let mut overdue = 0usize;
        for sub in core.store.iter() {
            if sub.status != SubStatus::Active {
                continue;
            }
            if sub.next_execution_at <= now {
                overdue += 1;
            }
            self.arm_for_subscription(sub, now);
            armed += 1;
        }
        tracing::info!(armed, overdue, "rearmed timers from store");
        armed
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.timers
            .lock()
            .expect("timer wheel lock poisoned")
            .next_deadline()
    }

    pub fn armed_timers_for(&self, sub_id: &str) -> usize {
        self.timers
            .lock()
            .expect("timer wheel lock poisoned")
            .armed_for(sub_id)
    }

    /// Fire every timer due at `now`. Ticks for distinct subscriptions run
    /// concurrently up to the configured cap; a tick for a subscription that
    /// is already dispatching is coalesced instead of fired.
    pub async fn process_due(&self, now: i64) -> usize {
        let due = {
            self.timers
                .lock()
                .expect("timer wheel lock poisoned")
                .pop_due(now)
        };
        if due.is_empty() {
            return 0;
        }

        let mut to_run = Vec::new();
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            for (sub_id, kind) in due {
                if in_flight.dispatching.contains(&sub_id) {
                    tracing::debug!(sub_id = %sub_id, ?kind, "tick coalesced; dispatch in flight");
                    in_flight.queued.insert(sub_id, (kind, now));
                    continue;
                }
                in_flight.dispatching.insert(sub_id.clone());
                to_run.push((sub_id, kind));
            }
        }

        let fired = to_run.len();
        futures::stream::iter(to_run)
            .for_each_concurrent(self.max_concurrency, |(sub_id, kind)| async move {
                self.tick(&sub_id, kind, now).await;
                self.finish_dispatch(&sub_id, now).await;
            })
            .await;
        fired
    }

    async fn tick(&self, sub_id: &str, kind: TimerKind, now: i64) {
        {
            let mut core = self.state.lock().await;
            if core.fatal.is_some() {
                tracing::error!(sub_id, "service is in a fatal state; dispatch suspended");
                return;
            }
            let Some(sub) = core.store.get(sub_id) else {
                return;
            };
            if sub.status != SubStatus::Active {
                return;
            }

            if core.cycles.below_floor() {
                if core.cycles.auto_refill_enabled {
                    admin::refill_from_fees(&mut core.cycles, self.auto_refill_amount, now);
                    tracing::warn!(
                        balance = core.cycles.balance,
                        "cycle balance was below floor; auto-refilled from fees"
                    );
                } else {
                    tracing::error!(
                        sub_id,
                        balance = core.cycles.balance,
                        threshold = core.cycles.threshold,
                        "cycle balance below floor; refusing to dispatch"
                    );
                    drop(core);
                    let retry_at = now + CYCLE_STARVED_RETRY_SECS;
                    match kind {
                        TimerKind::Payment => self.arm_payment(sub_id, retry_at),
                        TimerKind::Reminder => self.arm_reminder(sub_id, retry_at),
                    }
                    return;
                }
            }

            if !self.dry_run {
                core.cycles.balance = core.cycles.balance.saturating_sub(self.dispatch_cost_cycles);
                core.cycles.total_consumed = core
                    .cycles
                    .total_consumed
                    .saturating_add(self.dispatch_cost_cycles);
            }
        }

        if self.dry_run {
            tracing::info!(sub_id, ?kind, "DRY RUN: would dispatch");
            return;
        }

        match kind {
            TimerKind::Payment => {
                let outcome = self.dispatcher.dispatch(sub_id, Opcode::Payment).await;
                self.apply_payment_outcome(sub_id, outcome, now).await;
            }
            TimerKind::Reminder => {
                // Reminder outcomes never touch the store and never
                // reschedule themselves; the next reminder is armed when the
                // next payment period begins.
                let outcome = self.dispatcher.dispatch(sub_id, Opcode::Reminder).await;
                match outcome {
                    DispatchOutcome::Success { tx_id } => {
                        tracing::info!(sub_id, %tx_id, "reminder dispatched");
                    }
                    other => {
                        tracing::warn!(sub_id, outcome = ?other, "reminder dispatch did not confirm");
                    }
                }
            }
        }
    }

    async fn apply_payment_outcome(&self, sub_id: &str, outcome: DispatchOutcome, now: i64) {
        if let DispatchOutcome::Skipped(reason) = &outcome {
            tracing::debug!(sub_id, %reason, "payment tick skipped");
            return;
        }

        let mut core = self.state.lock().await;

        // The dispatch suspended; re-read before writing. A cancel or pause
        // that landed mid-flight wins and the outcome is discarded.
        let Some(sub) = core.store.get(sub_id) else {
            return;
        };
        if sub.status != SubStatus::Active {
            tracing::info!(
                sub_id,
                status = ?sub.status,
                "subscription changed mid-dispatch; discarding outcome"
            );
            return;
        }

        match outcome {
            DispatchOutcome::Success { tx_id } => {
                let Some(snap) = core.store.update(sub_id, |s| {
                    s.next_execution_at += s.interval_seconds as i64;
                    s.trigger_count += 1;
                    s.failed_payment_count = 0;
                    s.last_triggered_at = Some(now);
                    s.last_error = None;
                    s.updated_at = now;
                }) else {
                    return;
                };
                self.persist(&mut core);
                drop(core);

                self.arm_payment(sub_id, snap.next_execution_at);
                if let Some(reminder_at) = snap.reminder_at() {
                    if reminder_at > now {
                        self.arm_reminder(sub_id, reminder_at);
                    }
                }

                tracing::info!(
                    sub_id,
                    %tx_id,
                    trigger_count = snap.trigger_count,
                    next_execution_at = snap.next_execution_at,
                    "payment confirmed"
                );
                self.emit(webhook::EVENT_PAYMENT_SUCCESS, &snap, Some(tx_id), now);
            }
            DispatchOutcome::ChainReject(_)
            | DispatchOutcome::Transient(_)
            | DispatchOutcome::Unknown { .. } => {
                let (reason, tx_id, class) = match outcome {
                    DispatchOutcome::ChainReject(r) => (r, None, "chain_reject"),
                    DispatchOutcome::Transient(r) => (r, None, "transient"),
                    DispatchOutcome::Unknown { tx_id } => (
                        format!("unconfirmed transaction {tx_id}"),
                        Some(tx_id),
                        "unknown",
                    ),
                    _ => return,
                };

                let Some(snap) = core.store.update(sub_id, |s| {
                    s.failed_payment_count += 1;
                    s.last_failure_at = Some(now);
                    s.last_triggered_at = Some(now);
                    s.last_error = Some(truncate_reason(&reason));
                    s.updated_at = now;
                }) else {
                    return;
                };

                if snap.failed_payment_count >= MAX_CONSECUTIVE_FAILURES {
                    let Some(snap) = core.store.update(sub_id, |s| {
                        s.status = SubStatus::Paused;
                        s.updated_at = now;
                    }) else {
                        return;
                    };
                    self.persist(&mut core);
                    drop(core);

                    self.cancel_timers(sub_id);
                    tracing::warn!(
                        sub_id,
                        consecutive = snap.failed_payment_count,
                        reason = snap.last_error.as_deref().unwrap_or(""),
                        "auto-paused after consecutive failures; operator resume required"
                    );
                    self.emit(webhook::EVENT_AUTO_PAUSED, &snap, tx_id, now);
                } else {
                    let fire_at = retry_fire_at(
                        now,
                        snap.next_execution_at,
                        snap.interval_seconds,
                        snap.failed_payment_count,
                    );
                    self.persist(&mut core);
                    drop(core);

                    self.arm_payment(sub_id, fire_at);
                    tracing::warn!(
                        sub_id,
                        class,
                        consecutive = snap.failed_payment_count,
                        next_retry_at = fire_at,
                        reason = snap.last_error.as_deref().unwrap_or(""),
                        "payment failed; backing off"
                    );
                    self.emit(webhook::EVENT_PAYMENT_FAILURE, &snap, tx_id, now);
                }
            }
            DispatchOutcome::Skipped(_) => {}
        }
    }

    async fn finish_dispatch(&self, sub_id: &str, now: i64) {
        let queued = {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            in_flight.dispatching.remove(sub_id);
            in_flight.queued.remove(sub_id)
        };
        let Some((kind, fire_at)) = queued else {
            return;
        };

        let active = {
            let core = self.state.lock().await;
            core.store
                .get(sub_id)
                .map(|s| s.status == SubStatus::Active)
                .unwrap_or(false)
        };
        if !active {
            return;
        }

        // Outcome application usually re-armed the payment timer already;
        // only a still-unarmed kind needs the queued fire.
        let mut timers = self.timers.lock().expect("timer wheel lock poisoned");
        if !timers.is_armed(sub_id, kind) {
            timers.arm(sub_id, kind, fire_at.max(now));
            drop(timers);
            self.wake.notify_one();
        }
    }

    fn persist(&self, core: &mut CoreState) {
        if self.dry_run {
            return;
        }
        if let Err(err) = self.persister.save(core) {
            tracing::error!(error = %err, "failed to persist state");
            core.fatal = Some(format!("persistence failure: {err}"));
        }
    }

    fn emit(&self, event: &'static str, sub: &Subscription, tx_id: Option<String>, now: i64) {
        let Some(sink) = &self.webhook else {
            return;
        };
        sink.emit(EventEnvelope {
            event,
            sub_id: sub.sub_id.clone(),
            ts: now,
            trigger_count: sub.trigger_count,
            failed_count: sub.failed_payment_count,
            last_error: sub.last_error.clone(),
            tx_id,
        });
    }

    /// Daemon driver: fire due work, then sleep until the earliest deadline
    /// or an explicit wake from a lifecycle operation.
    pub async fn run(&self) {
        loop {
            let now = self.clock.now();
            let fired = self.process_due(now).await;
            if fired > 0 {
                tracing::debug!(fired, "processed due timers");
            }

            let now = self.clock.now();
            let sleep_for = match self.next_deadline() {
                Some(deadline) if deadline <= now => continue,
                Some(deadline) => Duration::from_secs((deadline - now) as u64),
                None => Duration::from_secs(IDLE_HEARTBEAT_SECS),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {}
            }
        }
    }
}

fn truncate_reason(reason: &str) -> String {
    // Keep diagnostics small so state stays lean; avoid slicing by bytes.
    const MAX: usize = 240;
    let mut out: String = reason.chars().take(MAX).collect();
    if out.len() < reason.len() {
        out.push_str("...");
    }
    out
}
