//! Traffic-Shift Verifier
//!
//! Runs the selected test group of traffic-shift scenarios against the mesh
//! and exits non-zero if any scenario fails or aborts.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (plain or JSON)
//! 3. Load the scenario catalog
//! 4. Wire the kubectl collaborators, fixed-settle waiter and TCP probes
//! 5. Run the suite, cancelling on Ctrl-C
//! 6. Log the suite report

use std::process::ExitCode;
use std::sync::Arc;

use shift_verifier::cluster::{IngressResolver, KubectlCluster, StaticIngress};
use shift_verifier::config::Config;
use shift_verifier::convergence::FixedSettle;
use shift_verifier::eventual::Backoff;
use shift_verifier::orchestrator::{log_suite_report, ShiftOrchestrator};
use shift_verifier::probe::TcpProbeFactory;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code when the run was interrupted (128 + SIGINT).
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.json_logs);

    info!(
        test_group = %config.test_group,
        namespace = %config.namespace,
        settle_secs = config.settle.as_secs(),
        probe_timeout_ms = u64::try_from(config.probe_timeout.as_millis()).unwrap_or(u64::MAX),
        probe_concurrency = config.probe_concurrency,
        "Starting traffic shift verifier"
    );

    let catalog = match config.catalog() {
        Ok(catalog) => catalog,
        Err(e) => {
            error!(error = %e, "Failed to load scenarios");
            return ExitCode::FAILURE;
        }
    };

    let cluster = Arc::new(
        KubectlCluster::new(config.namespace.clone())
            .with_kubeconfig(config.kubeconfig.clone())
            .with_ingress(config.ingress.clone()),
    );
    let ingress: Arc<dyn IngressResolver> = match &config.ingress_override {
        Some(endpoint) => Arc::new(StaticIngress(endpoint.clone())),
        None => cluster.clone(),
    };

    let orchestrator = ShiftOrchestrator::new(
        cluster.clone(),
        ingress,
        cluster,
        Arc::new(FixedSettle::new(config.settle)),
        Arc::new(TcpProbeFactory::new(config.probe_timeout)),
    )
    .with_concurrency(config.probe_concurrency)
    .with_ready_backoff(Backoff::with_timeout(config.ready_timeout));

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, cancelling traffic shift run");
                signal_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    match orchestrator
        .run_suite(&catalog, config.test_group, &cancel)
        .await
    {
        Ok(report) => {
            log_suite_report(&report);
            if report.cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else if report.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) if e.is_cancellation() => {
            warn!(error = %e, "Traffic shift run cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            error!(error = %e, "Traffic shift run aborted");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shift_verifier=info,shift=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
