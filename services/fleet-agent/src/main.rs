//! Fleet Agent
//!
//! One daemon per host. Reports status into the coordination store,
//! takes part in leader election, schedules declared tasks when leading,
//! and converges local apps to this host's topology record.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_agent::appmgr::AppManager;
use fleet_agent::config::Config;
use fleet_agent::coordinator::Coordinator;
use fleet_agent::reporter;
use fleet_agent::security::SecurityState;
use fleet_agent::store::{KvClient, LeaderElector, SessionManager};
use fleet_agent::supervisor::ProcessRuntime;
use fleet_agent::sync::{SecuritySyncer, TopologySyncer};
use fleet_agent::watch::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet agent");

    let config = Config::from_env()?;
    info!(
        node = %config.node_name,
        store_url = %config.store_url,
        scheduler = config.scheduler,
        worker = config.worker,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let kv = Arc::new(KvClient::new(config.store_url.clone()));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&kv),
        config.node_name.clone(),
        config.session_ttl_secs,
    ));
    if !config.recovered_session.is_empty() {
        sessions.recover(config.recovered_session.clone()).await;
    }

    if (config.scheduler || config.worker) && config.session_upkeep_enabled() {
        handles.push(tokio::spawn(reporter::run_session_upkeep(
            Arc::clone(&sessions),
            Duration::from_secs(config.session_renew_interval_secs()),
            shutdown_rx.clone(),
        )));
    }

    if config.worker && config.report_enabled() {
        handles.push(tokio::spawn(reporter::run_report_loop(
            Arc::clone(&kv),
            config.node_name.clone(),
            config.labels.clone(),
            Duration::from_secs(config.report_interval_secs),
            shutdown_rx.clone(),
        )));
    }

    if config.scheduler {
        let elector = LeaderElector::new(
            Arc::clone(&kv),
            Arc::clone(&sessions),
            config.node_name.clone(),
        );
        let coordinator = Coordinator::new(
            Arc::clone(&kv),
            Arc::clone(&sessions),
            elector,
            Duration::from_secs(config.schedule_interval_secs),
            config.report_interval_secs as i64,
        );
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            coordinator.run(shutdown_rx).await;
        }));
    }

    if config.worker {
        let runtime = Arc::new(ProcessRuntime::new(config.cgroup_root.clone()));
        let apps = Arc::new(AppManager::new(runtime));
        let syncer = Arc::new(TopologySyncer::new(
            Arc::clone(&kv),
            apps,
            config.node_name.clone(),
            config.service_health_port,
        ));
        handles.push(tokio::spawn(run_watch_loop(
            Arc::clone(&kv),
            format!("topology/{}", config.node_name),
            config.block_wait_secs,
            shutdown_rx.clone(),
            move || {
                let syncer = Arc::clone(&syncer);
                async move { syncer.sync_node_topology().await }
            },
        )));
    }

    if config.security_sync {
        let state = Arc::new(SecurityState::new());
        let syncer = Arc::new(SecuritySyncer::new(Arc::clone(&kv), state));
        handles.push(tokio::spawn(run_watch_loop(
            Arc::clone(&kv),
            "security".to_string(),
            config.block_wait_secs,
            shutdown_rx.clone(),
            move || {
                let syncer = Arc::clone(&syncer);
                async move { syncer.sync_security().await }
            },
        )));
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    info!("Fleet agent shutdown complete");
    Ok(())
}
