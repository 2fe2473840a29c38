// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of BGG Updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! BGG Updater - entry point
//!
//! The migration state machine runs first, synchronously, before anything
//! else. Only afterwards does the periodic update check loop start; it runs
//! as a low-priority background concern and its failures never take the
//! controller's input path down.

use bgg_updater::config::{DEFAULT_CONFIG_PATH, load_config};
use bgg_updater::events::{LogIndicator, StatusIndicator};
use bgg_updater::orchestrator::{Orchestrator, StatusHandle, UpdaterStatus};
use bgg_updater::state::UpdaterState;
use bgg_updater::transport::HttpTransport;
use bgg_updater::{BootOutcome, Migrator};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bgg_updater=debug".parse().unwrap()),
        )
        .init();

    info!("Starting BGG Updater");

    let config = load_config(Path::new(DEFAULT_CONFIG_PATH))?;
    info!(
        "Loaded config: auto_update={}, check_interval={}h, repository={}",
        config.auto_update, config.check_interval_hours, config.repository_url
    );

    let status = StatusHandle::new();
    let indicator = LogIndicator;
    let mut state = UpdaterState::load(&config.state_path)?;

    // Migration must reach a terminal state before anything else starts;
    // resuming early is the exact hazard this design prevents.
    status.set(UpdaterStatus::Promoting);
    indicator.updating();
    match Migrator::new(&config).run_at_boot() {
        Ok(BootOutcome::Complete { version }) => {
            info!("Booted into freshly promoted version {version}");
            state.record_success();
            state.save(&config.state_path)?;
            indicator.normal();
        }
        Ok(BootOutcome::Failed { version }) => {
            warn!("Promotion of {version} failed, continuing on previous firmware");
            state.record_failure(&version);
            state.save(&config.state_path)?;
            indicator.update_failed();
        }
        Ok(BootOutcome::Idle) => {
            indicator.normal();
        }
        Err(e) if e.is_fatal() => {
            // The active set may be a mix of two versions. Refuse normal
            // operation and leave the device in recovery.
            error!("Rollback failed, refusing to boot: {e}");
            indicator.recovery();
            return Err(e.into());
        }
        Err(e) => {
            warn!("Migration did not complete: {e}");
            indicator.update_failed();
        }
    }
    status.set(UpdaterStatus::Idle);

    let transport = Arc::new(HttpTransport::new(&config.repository_url)?);
    let orchestrator = Orchestrator::new(config.clone(), transport, status.clone());

    // Set up signal handling
    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_notify_clone = shutdown_notify.clone();
    tokio::spawn(async move {
        setup_signal_handlers(shutdown_notify_clone).await;
    });

    // Main loop
    let mut check_interval =
        tokio::time::interval(Duration::from_secs(config.check_interval_hours * 3600));

    loop {
        tokio::select! {
            _ = shutdown_notify.notified() => {
                info!("Shutdown signal received");
                break;
            }
            _ = check_interval.tick() => {
                if !config.auto_update {
                    continue;
                }

                match orchestrator.run_check_cycle().await {
                    Ok(outcome) => info!("Check cycle finished: {outcome:?}"),
                    Err(e) => error!("Check cycle error: {e}"),
                }
                info!("Updater status: {}", orchestrator.status());
            }
        }
    }

    Ok(())
}

async fn setup_signal_handlers(_shutdown_notify: Arc<Notify>) {
    // SIGTERM handler
    unsafe {
        let handler = SigHandler::Handler(sigterm_handler);
        let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }

    // SIGHUP handler
    unsafe {
        let handler = SigHandler::Handler(sighup_handler);
        let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
        let _ = signal::sigaction(Signal::SIGHUP, &action);
    }

    // Keep the task alive
    loop {
        sleep(Duration::from_secs(3600)).await;
    }
}

extern "C" fn sigterm_handler(_signal: nix::libc::c_int) {
    std::process::exit(0);
}

extern "C" fn sighup_handler(_signal: nix::libc::c_int) {
    // Config changes take effect on the next restart
}
