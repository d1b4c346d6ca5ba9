mod aggregator;
mod alerts;
mod analytics;
mod backoff;
mod breaker;
mod collectors;
mod config;
mod connectivity;
mod drift;
mod events;
mod hamclock_compat;
mod health;
mod history;
mod http;
mod leases;
mod lifecycle;
mod mqtt;
mod ops;
mod perf;
mod store;
mod util;
mod ws;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::alerts::{default_rules, AlertEngine, AlertSinks};
use crate::breaker::BreakerRegistry;
use crate::collectors::aredn::ArednSource;
use crate::collectors::hamclock::HamclockSource;
use crate::collectors::meshtastic::MeshtasticSource;
use crate::collectors::reticulum::ReticulumSource;
use crate::collectors::Collector;
use crate::config::Config;
use crate::connectivity::{ConnectivityConfig, ConnectivityTracker};
use crate::drift::DriftDetector;
use crate::events::EventBus;
use crate::health::HealthScorer;
use crate::history::HistoryStore;
use crate::leases::LeaseManager;
use crate::lifecycle::{shutdown_pair, Shutdown};
use crate::mqtt::BrokerSubscriber;
use crate::ops::OpsDeps;
use crate::perf::PerfMonitor;
use crate::store::NodeStore;
use crate::util::now_ts;
use crate::ws::WsBroadcaster;

/// How long each background task gets to wind down after the signal.
const JOIN_DEADLINE: Duration = Duration::from_secs(5);
const OFFLINE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "meshforge-maps", version, about = "Multi-source mesh network observability server")]
struct Cli {
    /// Bind address for the HTTP API (overrides settings.json)
    #[arg(long)]
    host: Option<String>,

    /// HTTP API port (overrides settings.json)
    #[arg(long)]
    port: Option<u16>,

    /// Print the terminal-dashboard hint after startup
    #[arg(long)]
    tui: bool,

    /// Serve the HTTP API only; the terminal dashboard polls it
    #[arg(long)]
    tui_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshforge_maps=info,rumqttc=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(exit) => exit,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    info!("meshforge-maps v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&config::settings_path());
    if let Some(host) = cli.host {
        config.http_host = host;
    }
    if let Some(port) = cli.port {
        config.http_port = port;
    }

    let warnings = config.verify();
    for warning in &warnings {
        warn!("startup verification: {warning}");
    }

    let (controller, shutdown) = shutdown_pair();

    // Long-lived registries, constructed in dependency order
    let bus = Arc::new(EventBus::new());
    let breakers = Arc::new(BreakerRegistry::new());
    let leases = Arc::new(LeaseManager::new());
    let perf = Arc::new(PerfMonitor::new());
    let store = Arc::new(NodeStore::new(config.max_nodes, config.stale_timeout_secs));

    // Operations layer
    let connectivity = Arc::new(ConnectivityTracker::new(ConnectivityConfig::default()));
    let health = Arc::new(HealthScorer::new());
    let drift = Arc::new(DriftDetector::new(50, config.max_nodes));
    let alerts = Arc::new(AlertEngine::new(default_rules(), config.alerts.max_history));

    // Eviction hooks run in a fixed order, outside the store mutex
    {
        let health = health.clone();
        let connectivity = connectivity.clone();
        let drift = drift.clone();
        store.set_on_removed(Box::new(move |node_id| {
            health.remove(node_id);
            connectivity.remove(node_id);
            drift.remove(node_id);
        }));
    }

    // Position history (fatal when the database cannot open)
    let db_path = config::history_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let history = Arc::new(HistoryStore::open(&db_path, config.history.throttle_seconds).await?);
    info!("node history at {}", db_path.display());

    // Broker subscriber
    let subscriber = config
        .mqtt
        .enabled
        .then(|| BrokerSubscriber::new(config.mqtt.clone(), store.clone(), bus.clone()));

    // Collectors, in enable-order
    let cache_dir = config::collector_cache_dir();
    let mut collector_set: Vec<Arc<Collector>> = Vec::new();
    let mut aredn_topology = None;
    let mut overlay = None;

    if config.sources.meshtastic {
        let source = MeshtasticSource::new(
            store.clone(),
            config.sources.meshtastic_api_url.clone(),
            leases.clone(),
        );
        collector_set.push(Arc::new(Collector::new(
            Box::new(source),
            breakers.breaker("meshtastic"),
            shutdown.clone(),
        )));
    }
    if config.sources.reticulum {
        let source = ReticulumSource::new(config.sources.reticulum_status_cmd.clone(), &cache_dir);
        collector_set.push(Arc::new(Collector::new(
            Box::new(source),
            breakers.breaker("reticulum"),
            shutdown.clone(),
        )));
    }
    if config.sources.aredn {
        let source = ArednSource::new(config.sources.aredn_nodes.clone());
        aredn_topology = Some(source.topology_handle());
        collector_set.push(Arc::new(Collector::new(
            Box::new(source),
            breakers.breaker("aredn"),
            shutdown.clone(),
        )));
    }
    if config.sources.hamclock {
        let source = HamclockSource::new(
            config.sources.hamclock_host.clone(),
            config.sources.spacewx_fallback_url.clone(),
        );
        overlay = Some(source.overlay_handle());
        collector_set.push(Arc::new(Collector::new(
            Box::new(source),
            breakers.breaker("hamclock"),
            shutdown.clone(),
        )));
    }

    let aggregator = Arc::new(Aggregator::new(
        collector_set,
        store.clone(),
        aredn_topology,
        overlay,
        bus.clone(),
        perf.clone(),
    ));

    // WebSocket broadcaster: absent under --tui-only or ws_enabled=false;
    // the HTTP poll path stays fully functional either way
    let ws = if config.ws_enabled && !cli.tui_only {
        let broadcaster = Arc::new(WsBroadcaster::new());
        match broadcaster
            .clone()
            .start(config.http_host.clone(), config.ws_port, shutdown.clone())
            .await
        {
            Ok(_) => Some(broadcaster),
            Err(e) => {
                warn!("websocket broadcaster disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    // Alert fan-out
    let sinks = Arc::new(AlertSinks {
        callback: None,
        mqtt_base_topic: config.mqtt.enabled.then(|| config.mqtt.alert_topic.clone()),
        webhook: config
            .alerts
            .webhook_url
            .clone()
            .map(|url| (reqwest::Client::new(), url)),
        bus: bus.clone(),
    });

    let deps = Arc::new(OpsDeps {
        config: config.clone(),
        bus: bus.clone(),
        store: store.clone(),
        history: history.clone(),
        connectivity: connectivity.clone(),
        health: health.clone(),
        drift: drift.clone(),
        alerts: alerts.clone(),
        sinks,
        subscriber: subscriber.clone(),
        ws: ws.clone(),
    });
    ops::start(deps.clone(), shutdown.clone());

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    if let Some(sub) = &subscriber {
        tasks.push(("mqtt", tokio::spawn(sub.clone().run(shutdown.clone()))));
    }

    // Aggregation polling loop
    {
        let aggregator = aggregator.clone();
        let deps = deps.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.poll_interval_secs.max(5));
        tasks.push((
            "aggregator",
            tokio::spawn(async move {
                loop {
                    aggregator.collect_all().await;
                    ops::cycle_pass(&deps, &aggregator).await;
                    if !shutdown.sleep(interval).await {
                        break;
                    }
                }
            }),
        ));
    }

    // Offline sweep
    {
        let aggregator = aggregator.clone();
        let deps = deps.clone();
        let shutdown = shutdown.clone();
        tasks.push((
            "offline-sweep",
            tokio::spawn(async move {
                loop {
                    if !shutdown.sleep(OFFLINE_SWEEP_INTERVAL).await {
                        break;
                    }
                    ops::offline_sweep(&deps, &aggregator).await;
                }
            }),
        ));
    }

    // History retention
    tasks.push((
        "retention",
        tokio::spawn(ops::retention_task(deps.clone(), shutdown.clone())),
    ));

    // HTTP API (fatal when no port binds)
    let state = Arc::new(http::AppState {
        config: config.clone(),
        started_at: now_ts(),
        aggregator: aggregator.clone(),
        history,
        alerts,
        health,
        connectivity,
        drift,
        breakers,
        bus,
        perf,
        leases,
        subscriber,
        ws: ws.clone(),
    });
    let http_port = http::serve(state, shutdown.clone()).await?;

    if cli.tui || cli.tui_only {
        info!(
            "terminal dashboard: run `meshforge-dash --url http://{}:{http_port}`",
            config.http_host
        );
    }
    info!(
        "ready: http://{}:{http_port} ({} sources{})",
        config.http_host,
        config.enabled_sources().len(),
        ws.as_ref()
            .and_then(|w| w.port())
            .map(|p| format!(", ws :{p}"))
            .unwrap_or_default(),
    );

    wait_for_shutdown(shutdown).await;
    info!("shutdown requested, stopping background tasks");
    controller.signal();

    for (name, handle) in tasks {
        match tokio::time::timeout(JOIN_DEADLINE, handle).await {
            Ok(_) => {}
            Err(_) => warn!("{name} task missed the {JOIN_DEADLINE:?} join deadline"),
        }
    }

    if warnings.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        info!("exiting with verification warnings");
        Ok(ExitCode::from(2))
    }
}

async fn wait_for_shutdown(shutdown: Shutdown) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("ctrl-c handler failed: {e}");
            }
        }
        _ = shutdown.wait() => {}
    }
}
