//! End-to-end scheduler flows driven through a scripted RPC and a manual
//! clock: literal timestamps, no wall-clock sleeps.

use base64::Engine;
use cadence_scheduler::dispatcher::Dispatcher;
use cadence_scheduler::license::StaticRegistry;
use cadence_scheduler::rpc::{MockRpc, SubmitResult, TxStatus};
use cadence_scheduler::scheduler::{Clock, ManualClock, Scheduler};
use cadence_scheduler::service::CadenceService;
use cadence_scheduler::signer::KeypairSigner;
use cadence_scheduler::store::{PersistedState, StatePersister};
use cadence_scheduler::types::{
    CoreState, CreateSubscriptionRequest, CycleState, HealthStatus, SharedState, SubStatus,
};
use cadence_scheduler::ServiceError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    service: CadenceService<MockRpc, KeypairSigner, StaticRegistry>,
    scheduler: Arc<Scheduler<MockRpc, KeypairSigner>>,
    rpc: Arc<MockRpc>,
    clock: Arc<ManualClock>,
    state: SharedState,
}

fn fresh_core() -> CoreState {
    CoreState::new(
        Some("root".to_string()),
        "F".repeat(32),
        CycleState {
            balance: 1_000_000,
            threshold: 0,
            auto_refill_enabled: false,
            total_consumed: 0,
            total_refilled: 0,
            last_refill_at: None,
        },
    )
}

fn build_with(now: i64, rpc: MockRpc, persister: StatePersister, core: CoreState) -> Harness {
    let clock = Arc::new(ManualClock::new(now));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let state: SharedState = Arc::new(tokio::sync::Mutex::new(core));
    let rpc = Arc::new(rpc);
    let signer = Arc::new(KeypairSigner::from_seed("test-key", [9u8; 32]));
    let persister = Arc::new(persister);

    let dispatcher = Dispatcher::new(state.clone(), rpc.clone(), signer.clone(), 1, Duration::ZERO);
    let scheduler = Arc::new(Scheduler::new(
        state.clone(),
        dispatcher,
        persister.clone(),
        None,
        dyn_clock.clone(),
        4,
        0,
        0,
        false,
    ));
    let service = CadenceService::new(
        state.clone(),
        scheduler.clone(),
        rpc.clone(),
        signer,
        Arc::new(StaticRegistry),
        persister,
        dyn_clock,
    );

    Harness {
        service,
        scheduler,
        rpc,
        clock,
        state,
    }
}

fn build(now: i64, rpc: MockRpc) -> Harness {
    build_with(now, rpc, StatePersister::in_memory(), fresh_core())
}

fn req(
    sub_id: &str,
    interval: u64,
    reminder_days: u8,
    amount: u64,
    start: Option<i64>,
) -> CreateSubscriptionRequest {
    CreateSubscriptionRequest {
        sub_id: sub_id.to_string(),
        settlement_contract: "C".repeat(32),
        token_mint: "M".repeat(32),
        payer: "P".repeat(32),
        merchant: "R".repeat(32),
        amount_hint: amount,
        interval_seconds: interval,
        reminder_days_before: reminder_days,
        start_time: start,
        api_key: "test-api-key".to_string(),
    }
}

fn temp_state_path(tag: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let n = SEQ.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir()
        .join(format!("cadence-flow-{tag}-{}-{n}", std::process::id()))
        .join("state.json")
}

#[tokio::test]
async fn happy_path_advances_exactly_one_interval() {
    let rpc = MockRpc::new();
    rpc.script_submit(SubmitResult::Submitted {
        tx_id: "sig-1".into(),
    });
    rpc.script_status(TxStatus::Confirmed);

    let h = build(1_000_000, rpc);
    let sub = h
        .service
        .create_subscription("alice", req("A", 3_600, 0, 10_000_000, None))
        .await
        .unwrap();
    assert_eq!(sub.next_execution_at, 1_003_600);
    assert_eq!(h.scheduler.next_deadline(), Some(1_003_600));

    h.clock.set(1_003_600);
    assert_eq!(h.scheduler.process_due(1_003_600).await, 1);

    let sub = h.service.get_subscription("alice", "A").await.unwrap();
    assert_eq!(sub.next_execution_at, 1_007_200);
    assert_eq!(sub.trigger_count, 1);
    assert_eq!(sub.failed_payment_count, 0);
    assert_eq!(sub.last_triggered_at, Some(1_003_600));
    assert_eq!(h.scheduler.next_deadline(), Some(1_007_200));
}

#[tokio::test]
async fn transient_storm_retries_through_backoff_then_succeeds() {
    let rpc = MockRpc::new();
    for _ in 0..5 {
        rpc.script_submit(SubmitResult::NetworkError {
            reason: "connection reset".into(),
        });
    }
    rpc.script_submit(SubmitResult::Submitted {
        tx_id: "sig-6".into(),
    });
    rpc.script_status(TxStatus::Confirmed);

    let h = build(1_000_000, rpc);
    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10_000_000, None))
        .await
        .unwrap();

    // Backoff base for a one-hour interval is 225s; the fifth retry would
    // overshoot and is clamped to the period boundary.
    let expected_deadlines = [1_003_825, 1_004_275, 1_005_175, 1_006_975, 1_007_200];

    let mut now = 1_003_600;
    for (k, expected_next_retry) in expected_deadlines.iter().enumerate() {
        h.clock.set(now);
        assert_eq!(h.scheduler.process_due(now).await, 1);

        let sub = h.service.get_subscription("alice", "A").await.unwrap();
        assert_eq!(sub.failed_payment_count, k as u32 + 1);
        assert!(sub.last_error.is_some());
        assert_eq!(sub.last_failure_at, Some(now));
        // Transient failures never advance the schedule.
        assert_eq!(sub.next_execution_at, 1_003_600);

        assert_eq!(h.scheduler.next_deadline(), Some(*expected_next_retry));
        now = *expected_next_retry;
    }

    h.clock.set(now);
    assert_eq!(h.scheduler.process_due(now).await, 1);

    let sub = h.service.get_subscription("alice", "A").await.unwrap();
    assert_eq!(sub.next_execution_at, 1_007_200);
    assert_eq!(sub.trigger_count, 1);
    assert_eq!(sub.failed_payment_count, 0);
    assert_eq!(sub.last_error, None);
}

#[tokio::test]
async fn ten_chain_rejects_auto_pause() {
    let rpc = MockRpc::new();
    for _ in 0..10 {
        rpc.script_submit(SubmitResult::RejectedByChain {
            reason: "insufficient funds".into(),
        });
    }

    let h = build(1_000_000, rpc);
    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10_000_000, None))
        .await
        .unwrap();

    for _ in 0..10 {
        let t = h
            .scheduler
            .next_deadline()
            .expect("a retry timer should stay armed until auto-pause");
        h.clock.set(t);
        assert_eq!(h.scheduler.process_due(t).await, 1);
    }

    let sub = h.service.get_subscription("alice", "A").await.unwrap();
    assert_eq!(sub.status, SubStatus::Paused);
    assert_eq!(sub.failed_payment_count, 10);
    assert_eq!(sub.last_error.as_deref(), Some("insufficient funds"));
    assert_eq!(h.scheduler.armed_timers_for("A"), 0);
    assert_eq!(h.scheduler.next_deadline(), None);

    // Operator resume restarts with a clean failure counter.
    h.service.resume_subscription("root", "A").await.unwrap();
    let sub = h.service.get_subscription("alice", "A").await.unwrap();
    assert_eq!(sub.status, SubStatus::Active);
    assert_eq!(sub.failed_payment_count, 0);
}

#[tokio::test]
async fn restart_fires_overdue_subscription_immediately() {
    let t0 = 1_000_000;
    let path = temp_state_path("restart");

    {
        let h = build_with(
            t0,
            MockRpc::new(),
            StatePersister::to_file(path.clone()),
            fresh_core(),
        );
        let sub = h
            .service
            .create_subscription("bob", req("B", 86_400, 0, 5_000_000, Some(t0)))
            .await
            .unwrap();
        assert_eq!(sub.next_execution_at, t0 + 86_400);
        // Process "stops" at t0 + 50_000 with nothing fired.
    }

    // Restart at t0 + 200_000: the stored fire time is long past.
    let rpc = MockRpc::new();
    rpc.script_submit(SubmitResult::Submitted {
        tx_id: "sig-b".into(),
    });
    rpc.script_status(TxStatus::Confirmed);

    let core = PersistedState::load(&path).unwrap().into_core();
    let h = build_with(t0 + 200_000, rpc, StatePersister::to_file(path.clone()), core);
    h.scheduler.rearm_from_store(t0 + 200_000).await;

    // The overdue timer is armed at its stored (past) fire time, so the
    // first pass picks it up immediately.
    assert_eq!(h.scheduler.next_deadline(), Some(t0 + 86_400));
    assert_eq!(h.scheduler.process_due(t0 + 200_000).await, 1);

    let sub = h.service.get_subscription("bob", "B").await.unwrap();
    // One interval from the original boundary, not from the restart time.
    assert_eq!(sub.next_execution_at, t0 + 172_800);
    assert_eq!(sub.trigger_count, 1);

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[tokio::test]
async fn cancel_during_inflight_dispatch_discards_the_outcome() {
    let rpc = MockRpc::gated();
    rpc.script_submit(SubmitResult::Submitted {
        tx_id: "sig-c".into(),
    });
    rpc.script_status(TxStatus::Confirmed);

    let h = build(1_000_000, rpc);
    h.service
        .create_subscription("carol", req("C", 3_600, 0, 1_000, None))
        .await
        .unwrap();

    let scheduler = h.scheduler.clone();
    let worker = tokio::spawn(async move { scheduler.process_due(1_003_600).await });

    // Wait until the dispatch is suspended inside submit, then cancel.
    h.rpc.gate().unwrap().entered.notified().await;
    h.service.cancel_subscription("carol", "C").await.unwrap();
    h.rpc.gate().unwrap().release.notify_one();
    worker.await.unwrap();

    let sub = h.service.get_subscription("carol", "C").await.unwrap();
    assert_eq!(sub.status, SubStatus::Cancelled);
    // The confirmed outcome was discarded: no bookkeeping moved.
    assert_eq!(sub.trigger_count, 0);
    assert_eq!(sub.next_execution_at, 1_003_600);
    assert_eq!(h.scheduler.armed_timers_for("C"), 0);
}

#[tokio::test]
async fn reminder_fires_once_without_touching_the_schedule() {
    let t0 = 1_000_000;
    let rpc = MockRpc::new();
    rpc.script_submit(SubmitResult::Submitted {
        tx_id: "sig-rem".into(),
    });
    rpc.script_status(TxStatus::Confirmed);

    let h = build(t0, rpc);
    let sub = h
        .service
        .create_subscription("dave", req("D", 2_592_000, 3, 7_000, Some(t0)))
        .await
        .unwrap();
    let payment_at = t0 + 2_592_000;
    let reminder_at = payment_at - 3 * 86_400;
    assert_eq!(sub.next_execution_at, payment_at);
    assert_eq!(h.scheduler.armed_timers_for("D"), 2);
    assert_eq!(h.scheduler.next_deadline(), Some(reminder_at));

    h.clock.set(reminder_at);
    assert_eq!(h.scheduler.process_due(reminder_at).await, 1);

    let sub = h.service.get_subscription("dave", "D").await.unwrap();
    assert_eq!(sub.next_execution_at, payment_at);
    assert_eq!(sub.trigger_count, 0);
    assert_eq!(sub.failed_payment_count, 0);

    // The reminder never reschedules itself; only the payment timer remains.
    assert_eq!(h.scheduler.armed_timers_for("D"), 1);
    assert_eq!(h.scheduler.next_deadline(), Some(payment_at));
    assert_eq!(h.scheduler.process_due(reminder_at).await, 0);

    // The dispatched blob carried the reminder opcode byte.
    let blobs = h.rpc.submitted_blobs();
    assert_eq!(blobs.len(), 1);
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&blobs[0])
        .unwrap();
    assert_eq!(raw[1], 0x01);
}

#[tokio::test]
async fn unconfirmed_submission_counts_as_failure_without_advancing() {
    let rpc = MockRpc::new();
    rpc.script_submit(SubmitResult::Submitted {
        tx_id: "sig-x".into(),
    });
    rpc.script_status(TxStatus::Pending);

    let h = build(1_000_000, rpc);
    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10, None))
        .await
        .unwrap();

    h.clock.set(1_003_600);
    assert_eq!(h.scheduler.process_due(1_003_600).await, 1);

    let sub = h.service.get_subscription("alice", "A").await.unwrap();
    assert_eq!(sub.failed_payment_count, 1);
    assert_eq!(sub.next_execution_at, 1_003_600);
    assert!(sub.last_error.as_deref().unwrap().contains("sig-x"));
    // A retry is armed.
    assert_eq!(h.scheduler.next_deadline(), Some(1_003_825));
}

#[tokio::test]
async fn pause_resume_round_trip_preserves_counters() {
    let h = build(1_000_000, MockRpc::new());
    h.service
        .create_subscription("alice", req("A", 3_600, 2, 10, None))
        .await
        .unwrap();

    h.service.pause_subscription("alice", "A").await.unwrap();
    let paused = h.service.get_subscription("alice", "A").await.unwrap();
    assert_eq!(paused.status, SubStatus::Paused);
    assert_eq!(paused.next_execution_at, 1_003_600);
    assert_eq!(h.scheduler.armed_timers_for("A"), 0);

    h.service.resume_subscription("alice", "A").await.unwrap();
    let resumed = h.service.get_subscription("alice", "A").await.unwrap();
    assert_eq!(resumed.status, SubStatus::Active);
    assert_eq!(resumed.next_execution_at, 1_003_600);
    assert_eq!(resumed.trigger_count, paused.trigger_count);
    assert_eq!(resumed.failed_payment_count, paused.failed_payment_count);
    assert_eq!(h.scheduler.next_deadline(), Some(1_003_600));

    // Double pause / double resume are conflicts, not corruption.
    h.service.pause_subscription("alice", "A").await.unwrap();
    assert!(matches!(
        h.service.pause_subscription("alice", "A").await,
        Err(ServiceError::Conflict(_))
    ));
    h.service.resume_subscription("alice", "A").await.unwrap();
    assert!(matches!(
        h.service.resume_subscription("alice", "A").await,
        Err(ServiceError::Conflict(_))
    ));
}

#[tokio::test]
async fn resume_of_an_overdue_subscription_fires_now_not_next_period() {
    let h = build(1_000_000, MockRpc::new());
    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10, None))
        .await
        .unwrap();
    h.service.pause_subscription("alice", "A").await.unwrap();

    // Well past the stored fire time.
    h.clock.set(1_050_000);
    h.service.resume_subscription("alice", "A").await.unwrap();
    assert_eq!(h.scheduler.next_deadline(), Some(1_050_000));

    let sub = h.service.get_subscription("alice", "A").await.unwrap();
    // The stored schedule itself is untouched until a payment succeeds.
    assert_eq!(sub.next_execution_at, 1_003_600);
}

#[tokio::test]
async fn cancel_is_idempotent_after_the_first_call() {
    let h = build(1_000_000, MockRpc::new());
    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10, None))
        .await
        .unwrap();

    h.service.cancel_subscription("alice", "A").await.unwrap();
    let second = h.service.cancel_subscription("alice", "A").await;
    assert!(matches!(second, Err(ServiceError::Conflict(_))));

    // The entry is retained for audit until cleanup.
    let sub = h.service.get_subscription("alice", "A").await.unwrap();
    assert_eq!(sub.status, SubStatus::Cancelled);

    // Cleanup removes only entries older than the watermark.
    assert_eq!(
        h.service
            .cleanup_old_subscriptions("root", 1_000_000)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        h.service
            .cleanup_old_subscriptions("root", 2_000_000)
            .await
            .unwrap(),
        1
    );
    assert!(matches!(
        h.service.get_subscription("alice", "A").await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_create_conflicts_and_leaves_no_timer_behind() {
    let h = build(1_000_000, MockRpc::new());
    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10, None))
        .await
        .unwrap();
    let err = h
        .service
        .create_subscription("alice", req("A", 7_200, 0, 20, None))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    // The original schedule is untouched.
    assert_eq!(h.scheduler.armed_timers_for("A"), 1);
    assert_eq!(h.scheduler.next_deadline(), Some(1_003_600));
}

#[tokio::test]
async fn emergency_pause_resumes_only_what_it_paused() {
    let h = build(1_000_000, MockRpc::new());
    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10, None))
        .await
        .unwrap();
    h.service
        .create_subscription("alice", req("B", 7_200, 0, 10, None))
        .await
        .unwrap();
    h.service
        .create_subscription("bob", req("C", 3_600, 0, 10, None))
        .await
        .unwrap();

    // C was paused by its owner before the emergency.
    h.service.pause_subscription("bob", "C").await.unwrap();

    assert_eq!(h.service.emergency_pause_all("root").await.unwrap(), 2);
    for id in ["A", "B", "C"] {
        assert_eq!(h.scheduler.armed_timers_for(id), 0);
        let sub = h.service.get_subscription("root", id).await.unwrap();
        assert_eq!(sub.status, SubStatus::Paused);
    }

    assert_eq!(h.service.resume_operations("root").await.unwrap(), 2);
    assert_eq!(
        h.service
            .get_subscription("root", "A")
            .await
            .unwrap()
            .status,
        SubStatus::Active
    );
    assert_eq!(
        h.service
            .get_subscription("root", "B")
            .await
            .unwrap()
            .status,
        SubStatus::Active
    );
    // The owner's own pause survives.
    assert_eq!(
        h.service
            .get_subscription("root", "C")
            .await
            .unwrap()
            .status,
        SubStatus::Paused
    );
}

#[tokio::test]
async fn admin_surface_is_gated_until_bootstrap() {
    let mut core = fresh_core();
    core.acl = cadence_scheduler::admin::Acl::new(None);
    let h = build_with(1_000_000, MockRpc::new(), StatePersister::in_memory(), core);

    assert!(matches!(
        h.service.emergency_pause_all("anyone").await,
        Err(ServiceError::Authorization(_))
    ));
    assert!(matches!(
        h.service.add_reader("anyone", "r".into()).await,
        Err(ServiceError::Authorization(_))
    ));

    h.service.initialize_first_admin("anyone").await.unwrap();
    assert!(h.service.emergency_pause_all("anyone").await.is_ok());
    assert!(matches!(
        h.service.initialize_first_admin("late").await,
        Err(ServiceError::Conflict(_))
    ));
}

#[tokio::test]
async fn health_degrades_with_failures_and_cycle_floor() {
    let rpc = MockRpc::new();
    rpc.script_submit(SubmitResult::NetworkError {
        reason: "down".into(),
    });

    let h = build(1_000_000, rpc);
    assert_eq!(h.service.get_canister_health().await.status, HealthStatus::Ok);

    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10, None))
        .await
        .unwrap();
    h.clock.set(1_003_600);
    h.scheduler.process_due(1_003_600).await;

    let health = h.service.get_canister_health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.failing_subscriptions, 1);

    // Below the cycle floor the service is critical and dispatch is refused.
    {
        let mut core = h.state.lock().await;
        core.cycles.threshold = 2_000_000;
    }
    assert_eq!(
        h.service.get_canister_health().await.status,
        HealthStatus::Critical
    );
}

#[tokio::test]
async fn listing_is_owner_scoped_unless_reader() {
    let h = build(1_000_000, MockRpc::new());
    h.service
        .create_subscription("alice", req("A1", 3_600, 0, 10, None))
        .await
        .unwrap();
    h.clock.set(1_000_001);
    h.service
        .create_subscription("alice", req("A2", 3_600, 0, 10, None))
        .await
        .unwrap();
    h.service
        .create_subscription("bob", req("B1", 3_600, 0, 10, None))
        .await
        .unwrap();

    let page = h
        .service
        .list_subscriptions("alice", None, 1, None)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].sub_id, "A1");
    let rest = h
        .service
        .list_subscriptions("alice", None, 10, Some("A1"))
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].sub_id, "A2");

    assert!(matches!(
        h.service.list_subscriptions("bob", Some("alice"), 10, None).await,
        Err(ServiceError::Authorization(_))
    ));

    h.service.add_reader("root", "bob".into()).await.unwrap();
    let seen = h
        .service
        .list_subscriptions("bob", Some("alice"), 10, None)
        .await
        .unwrap();
    assert_eq!(seen.len(), 2);
}

#[tokio::test]
async fn metadata_is_opaque_write_through_with_admin_delete() {
    let h = build(1_000_000, MockRpc::new());
    h.service
        .create_subscription("alice", req("A", 3_600, 0, 10, None))
        .await
        .unwrap();

    assert!(matches!(
        h.service
            .put_encrypted_metadata("alice", "A", "not base64!!".into())
            .await,
        Err(ServiceError::Validation(_))
    ));

    let blob = base64::engine::general_purpose::STANDARD.encode(b"ciphertext");
    h.service
        .put_encrypted_metadata("alice", "A", blob.clone())
        .await
        .unwrap();
    assert_eq!(
        h.service.get_encrypted_metadata("alice", "A").await.unwrap(),
        Some(blob)
    );
    assert!(matches!(
        h.service.get_encrypted_metadata("bob", "A").await,
        Err(ServiceError::Authorization(_))
    ));

    // Erasure is admin-only.
    assert!(matches!(
        h.service.delete_encrypted_metadata("alice", "A").await,
        Err(ServiceError::Authorization(_))
    ));
    h.service.delete_encrypted_metadata("root", "A").await.unwrap();
    assert_eq!(
        h.service.get_encrypted_metadata("alice", "A").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn fee_change_honors_the_waiting_period_through_the_service() {
    let h = build(1_000_000, MockRpc::new());
    h.service
        .propose_fee_address_change("root", "N".repeat(32))
        .await
        .unwrap();

    h.clock.set(1_000_000 + 7 * 86_400 - 1);
    assert!(matches!(
        h.service.execute_fee_address_change("root").await,
        Err(ServiceError::Conflict(_))
    ));

    h.clock.set(1_000_000 + 7 * 86_400);
    let addr = h.service.execute_fee_address_change("root").await.unwrap();
    assert_eq!(addr, "N".repeat(32));

    let gov = h.service.get_fee_governance("root").await.unwrap();
    assert_eq!(gov.current_addr(), &"N".repeat(32));
}

#[tokio::test]
async fn cycle_accounting_is_admin_gated_bookkeeping() {
    let h = build(1_000_000, MockRpc::new());

    assert!(matches!(
        h.service.set_cycle_threshold("alice", 5).await,
        Err(ServiceError::Authorization(_))
    ));

    h.service.set_cycle_threshold("root", 500).await.unwrap();
    h.service.enable_auto_refill("root", true).await.unwrap();
    let balance = h.service.refill_cycles_from_fees("root", 250).await.unwrap();
    assert_eq!(balance, 1_000_250);

    let status = h.service.get_cycle_status("root").await.unwrap();
    assert_eq!(status.current, 1_000_250);
    assert_eq!(status.threshold, 500);
    assert!(status.auto_refill_enabled);
    assert_eq!(status.total_refilled, 250);
    assert_eq!(status.last_refill, Some(1_000_000));

    assert_eq!(h.service.ping(), "pong");
}

#[tokio::test]
async fn withdrawal_submits_a_signed_transfer() {
    let rpc = MockRpc::new();
    rpc.script_submit(SubmitResult::Submitted {
        tx_id: "sig-w".into(),
    });

    let h = build(1_000_000, rpc);
    let tx = h
        .service
        .admin_withdraw_sol("root", &"W".repeat(32), 500)
        .await
        .unwrap();
    assert_eq!(tx, "sig-w");

    let blobs = h.rpc.submitted_blobs();
    assert_eq!(blobs.len(), 1);
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&blobs[0])
        .unwrap();
    assert_eq!(raw[1], 0x10);

    assert!(matches!(
        h.service.admin_withdraw_sol("alice", &"W".repeat(32), 500).await,
        Err(ServiceError::Authorization(_))
    ));
}
