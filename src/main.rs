use cadence_scheduler::config::{Network, ServiceConfig};
use cadence_scheduler::dispatcher::Dispatcher;
use cadence_scheduler::license::{HttpLicenseRegistry, Registry, StaticRegistry};
use cadence_scheduler::rpc::HttpRpcClient;
use cadence_scheduler::scheduler::{now_unix, Scheduler, SystemClock};
use cadence_scheduler::service::CadenceService;
use cadence_scheduler::signer::{KeypairSigner, Signer};
use cadence_scheduler::store::{PersistedState, StatePersister};
use cadence_scheduler::types::{CoreState, CycleState};
use cadence_scheduler::webhook::WebhookSink;
use clap::Parser;
use eyre::{eyre, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "cadence-scheduler",
    version,
    about = "Cadence recurring-payment scheduler: dispatches signed payment opcodes to a Solana settlement contract."
)]
struct Args {
    /// Settlement network.
    #[arg(long, value_enum, default_value_t = Network::Devnet)]
    network: Network,

    /// Override RPC URL. If omitted, uses CADENCE_RPC_URL or the network default.
    #[arg(long)]
    rpc_url: Option<String>,

    /// Environment variable that contains the hex-encoded 32-byte signing seed.
    #[arg(long, default_value = "CADENCE_SIGNING_KEY")]
    signing_key_env: String,

    /// Read the signing seed from a file instead of the environment.
    #[arg(long)]
    signing_key_file: Option<PathBuf>,

    /// Named key identifier, for logs and config only.
    #[arg(long, default_value = "cadence-dispatch-key")]
    signing_key_id: String,

    /// Where to store service state. Timers are rebuilt from it on boot.
    #[arg(long, default_value = "state/cadence.json")]
    state_file: PathBuf,

    /// Principal that local daemon invocations act as.
    #[arg(long, default_value = "operator")]
    operator_principal: String,

    /// Optional initial admin for a fresh deployment. Without it, the first
    /// caller of initialize_first_admin becomes the admin.
    #[arg(long)]
    initial_admin: Option<String>,

    /// Optional webhook sink for payment events.
    #[arg(long, env = "CADENCE_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Optional license registry base URL. Without it, API keys are accepted
    /// unmetered.
    #[arg(long, env = "CADENCE_LICENSE_URL")]
    license_url: Option<String>,

    /// Bound on every outcall, in seconds.
    #[arg(long, default_value_t = 30)]
    rpc_timeout_seconds: u64,

    /// Max concurrent RPC submissions.
    #[arg(long, default_value_t = 10)]
    max_inflight_submissions: usize,

    /// Status polls after a submit before classifying the tx as unknown.
    #[arg(long, default_value_t = 3)]
    confirmation_polls: u32,

    /// Delay between status polls, in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    confirmation_poll_ms: u64,

    /// Max concurrent dispatches across different subscriptions.
    #[arg(long, default_value_t = 10)]
    max_concurrency: usize,

    /// Cycles consumed per dispatch attempt.
    #[arg(long, default_value_t = 1_000_000)]
    dispatch_cost_cycles: u64,

    /// Cycles credited by one auto-refill step.
    #[arg(long, default_value_t = 50_000_000_000)]
    auto_refill_amount: u64,

    /// Starting cycle balance for a fresh deployment.
    #[arg(long, default_value_t = 1_000_000_000_000)]
    initial_cycle_balance: u64,

    /// Dispatch floor: below this balance the scheduler refuses to dispatch.
    #[arg(long, default_value_t = 100_000_000_000)]
    initial_cycle_threshold: u64,

    /// Fee collection address for a fresh deployment. Changing it later goes
    /// through the two-stage governance flow.
    #[arg(long, default_value = "FeeCollector11111111111111111111")]
    fee_address: String,

    /// Run a single due-work pass and exit.
    #[arg(long)]
    once: bool,

    /// Don't dispatch or persist; only log what would be done. Pairs well
    /// with --once.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let cfg = ServiceConfig {
        network: args.network,
        rpc_url: ServiceConfig::resolve_rpc_url(args.network, args.rpc_url),
        signing_key_id: args.signing_key_id,
        state_file: args.state_file,
        operator_principal: args.operator_principal,
        initial_admin: args.initial_admin,
        webhook_url: args.webhook_url,
        license_url: args.license_url,
        rpc_timeout: Duration::from_secs(args.rpc_timeout_seconds.max(1)),
        max_in_flight_submissions: args.max_inflight_submissions.max(1),
        confirmation_polls: args.confirmation_polls.max(1),
        confirmation_poll_interval: Duration::from_millis(args.confirmation_poll_ms),
        max_concurrency: args.max_concurrency.max(1),
        dispatch_cost_cycles: args.dispatch_cost_cycles,
        auto_refill_amount: args.auto_refill_amount,
        once: args.once,
        dry_run: args.dry_run,
    };

    let signer = match &args.signing_key_file {
        Some(path) => KeypairSigner::from_file(&cfg.signing_key_id, path)?,
        None => KeypairSigner::from_env(&cfg.signing_key_id, &args.signing_key_env)?,
    };
    let signer = Arc::new(signer);

    // Ensure the state directory exists before we create/lock the lockfile.
    if let Some(parent) = cfg.state_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }
    }

    // Single-instance guard: lock alongside the state file. Two schedulers
    // sharing one signer and state would double-dispatch.
    let lock_path = cfg.state_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "scheduler already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    let core = if cfg.state_file.exists() {
        PersistedState::load(&cfg.state_file)?.into_core()
    } else {
        let core = CoreState::new(
            cfg.initial_admin.clone(),
            args.fee_address,
            CycleState {
                balance: args.initial_cycle_balance,
                threshold: args.initial_cycle_threshold,
                auto_refill_enabled: false,
                total_consumed: 0,
                total_refilled: 0,
                last_refill_at: None,
            },
        );
        if !cfg.dry_run {
            PersistedState::from_core(&core).save(&cfg.state_file)?;
        }
        core
    };

    let subscriptions = core.store.len();
    let state = Arc::new(tokio::sync::Mutex::new(core));

    // Dry runs read existing state but never write it back.
    let persister = Arc::new(if cfg.dry_run {
        StatePersister::in_memory()
    } else {
        StatePersister::to_file(cfg.state_file.clone())
    });

    let rpc = Arc::new(HttpRpcClient::new(
        cfg.rpc_url.clone(),
        cfg.rpc_timeout,
        cfg.max_in_flight_submissions,
    )?);

    let webhook = match &cfg.webhook_url {
        Some(url) => Some(Arc::new(WebhookSink::new(url.clone(), cfg.rpc_timeout)?)),
        None => None,
    };

    let license = Arc::new(match &cfg.license_url {
        Some(url) => Registry::Http(HttpLicenseRegistry::new(url.clone(), cfg.rpc_timeout)?),
        None => Registry::Static(StaticRegistry),
    });

    let clock: Arc<dyn cadence_scheduler::Clock> = Arc::new(SystemClock);

    let dispatcher = Dispatcher::new(
        state.clone(),
        rpc.clone(),
        signer.clone(),
        cfg.confirmation_polls,
        cfg.confirmation_poll_interval,
    );
    let scheduler = Arc::new(Scheduler::new(
        state.clone(),
        dispatcher,
        persister.clone(),
        webhook,
        clock.clone(),
        cfg.max_concurrency,
        cfg.dispatch_cost_cycles,
        cfg.auto_refill_amount,
        cfg.dry_run,
    ));
    let service = CadenceService::new(
        state.clone(),
        scheduler.clone(),
        rpc,
        signer.clone(),
        license,
        persister.clone(),
        clock,
    );

    tracing::info!(
        network = cfg.network.as_str(),
        rpc_url = %cfg.rpc_url,
        signing_key = %cfg.signing_key_id,
        public_key = %hex::encode(signer.public_key()),
        state_file = %cfg.state_file.display(),
        subscriptions,
        once = cfg.once,
        dry_run = cfg.dry_run,
        "scheduler starting"
    );

    // Timers are ephemeral; the store is authoritative. Rearm before
    // servicing anything else so overdue subscriptions fire immediately.
    let now = now_unix();
    scheduler.rearm_from_store(now).await;

    if cfg.once {
        let fired = scheduler.process_due(now_unix()).await;
        tracing::info!(fired, "single pass complete");
    } else {
        tokio::select! {
            _ = scheduler.run() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
        }
    }

    // Final save so in-memory counters (cycles, diagnostics) survive.
    {
        let core = service.state().lock().await;
        if let Err(err) = persister.save(&core) {
            tracing::error!(error = %err, "final state save failed");
        }
    }

    let health = service.get_canister_health().await;
    tracing::info!(status = ?health.status, active = health.active_subscriptions, "scheduler stopped");

    Ok(())
}
