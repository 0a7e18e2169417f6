//! Daemon and one-shot drivers for the controller
//!
//! The daemon holds the instance lease for its whole life, renews it before
//! and throughout each cycle, sleeps adaptively between cycles and stops on shutdown, on a
//! fatal error class, or after too many consecutive failed cycles.

use super::{next_sleep, SyncController};
use crate::config::SyncConfig;
use crate::error::{ExitStatus, Result, SyncError};
use crate::models::{SyncPhase, SyncStatusRecord};
use crate::store::{keep_lock_alive, with_lock, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Reloads configuration from wherever it came from
pub type ConfigLoader = Box<dyn Fn() -> Result<SyncConfig> + Send + Sync>;

/// Builds a controller for a configuration
pub type ControllerFactory = Box<dyn Fn(&SyncConfig, CancellationToken) -> Result<SyncController> + Send + Sync>;

/// Last known status of a running daemon
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<SyncStatusRecord>>,
}

impl StatusHandle {
    pub fn new(initial: SyncStatusRecord) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn current(&self) -> SyncStatusRecord {
        self.inner.read().await.clone()
    }

    async fn set(&self, status: SyncStatusRecord) {
        *self.inner.write().await = status;
    }
}

/// Requests a configuration reload at the next cycle boundary
#[derive(Clone, Default)]
pub struct ReloadHandle {
    requested: Arc<AtomicBool>,
}

impl ReloadHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

pub struct Daemon {
    config: SyncConfig,
    loader: ConfigLoader,
    factory: ControllerFactory,
    store: Arc<dyn Store>,
    holder: String,
    cancel: CancellationToken,
    reload: ReloadHandle,
    status: StatusHandle,
}

impl Daemon {
    pub fn new(
        config: SyncConfig,
        loader: ConfigLoader,
        factory: ControllerFactory,
        store: Arc<dyn Store>,
        holder: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let status = StatusHandle::new(SyncStatusRecord::new(config.sync.instance_name.clone()));
        Self {
            config,
            loader,
            factory,
            store,
            holder: holder.into(),
            cancel,
            reload: ReloadHandle::default(),
            status,
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    /// Loop cycles until shutdown or a fatal stop
    ///
    /// Returns `Ok` on graceful shutdown. The instance lease is released on
    /// every exit path.
    pub async fn run(mut self) -> Result<()> {
        let lock = self.config.sync.instance_lock();
        if !self
            .store
            .try_acquire_lock(&lock, &self.holder, self.config.sync.lock_ttl())
            .await?
        {
            return Err(SyncError::LockHeld { name: lock });
        }
        info!(instance = %self.config.sync.instance_name, holder = %self.holder, "Daemon started");

        let result = self.cycle_loop().await;

        let lock = self.config.sync.instance_lock();
        if let Err(e) = self.store.release_lock(&lock, &self.holder).await {
            warn!(lock = %lock, error = %e, "Failed to release instance lock, it will expire");
        }
        match &result {
            Ok(()) => info!("Daemon stopped"),
            Err(e) => error!(error = %e, class = %e.class(), "Daemon stopped on error"),
        }
        result
    }

    async fn cycle_loop(&mut self) -> Result<()> {
        let mut controller = (self.factory)(&self.config, self.cancel.clone())?;
        let mut status = self
            .store
            .read_status(&self.config.sync.instance_name)
            .await?
            .unwrap_or_else(|| SyncStatusRecord::new(self.config.sync.instance_name.clone()));
        status.consecutive_failures = 0;
        let mut sleep = self.config.sync.min_sleep();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            if self.reload.take() {
                if let Some(reloaded) = self.reload_config() {
                    controller = reloaded;
                    sleep = sleep.clamp(self.config.sync.min_sleep(), self.config.sync.max_sleep());
                }
            }

            let lock = self.config.sync.instance_lock();
            if !self
                .store
                .renew_lock(&lock, &self.holder, self.config.sync.lock_ttl())
                .await?
            {
                error!(lock = %lock, anomaly = "instance_lease_lost", "Instance lease lost, stopping");
                return Err(SyncError::LockHeld { name: lock });
            }

            status.phase = SyncPhase::Fetching;
            self.status.set(status.clone()).await;

            let result = keep_lock_alive(
                self.store.as_ref(),
                &lock,
                &self.holder,
                self.config.sync.lock_ttl(),
                controller.run_cycle(),
            )
            .await;
            if matches!(&result, Err(e) if e.is_cancelled()) {
                info!("Shutdown requested during cycle");
                status.phase = SyncPhase::Idle;
                self.status.set(status).await;
                return Ok(());
            }

            let failures = controller.record_status(&mut status, &result).await;
            self.status.set(status.clone()).await;

            match result {
                Ok(report) => {
                    sleep = next_sleep(sleep, report.work_done(), controller.config());
                    info!(
                        outcome = ?report.outcome,
                        work_done = report.work_done(),
                        next_sleep_secs = sleep.as_secs(),
                        "Cycle finished"
                    );
                },
                Err(e) => {
                    let class = e.class();
                    error!(error = %e, class = %class, consecutive_failures = failures, "Cycle failed");
                    if class.is_fatal() {
                        return Err(e);
                    }
                    if failures >= controller.config().max_consecutive_failures {
                        error!(
                            consecutive_failures = failures,
                            anomaly = "consecutive_failure_limit",
                            "Too many consecutive failed cycles, stopping"
                        );
                        return Err(e);
                    }
                    sleep = next_sleep(sleep, 0, controller.config());
                },
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(sleep) => {},
            }
        }
    }

    /// Load and apply a new configuration, keeping the old one on failure
    fn reload_config(&mut self) -> Option<SyncController> {
        let config = match (self.loader)() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Configuration reload failed, keeping previous configuration");
                return None;
            },
        };
        if config.sync.instance_name != self.config.sync.instance_name {
            warn!(
                current = %self.config.sync.instance_name,
                requested = %config.sync.instance_name,
                "Instance name cannot change on reload, keeping previous configuration"
            );
            return None;
        }
        match (self.factory)(&config, self.cancel.clone()) {
            Ok(controller) => {
                info!("Configuration reloaded");
                self.config = config;
                Some(controller)
            },
            Err(e) => {
                warn!(error = %e, "Reloaded configuration rejected, keeping previous configuration");
                None
            },
        }
    }
}

/// Run exactly one cycle under the instance lease
pub async fn run_once(controller: &SyncController, store: &dyn Store, holder: &str) -> ExitStatus {
    let config = controller.config();
    let instance = config.instance_name.clone();
    let result = with_lock(store, &config.instance_lock(), holder, config.lock_ttl(), || async {
        let mut status = store
            .read_status(&instance)
            .await?
            .unwrap_or_else(|| SyncStatusRecord::new(instance.clone()));
        let result = controller.run_cycle().await;
        controller.record_status(&mut status, &result).await;
        result
    })
    .await;

    match result {
        Ok(report) => {
            info!(outcome = ?report.outcome, fetched = report.fetched, "One-shot cycle finished");
            report.exit_status()
        },
        Err(e) => {
            let status = ExitStatus::for_error(&e);
            error!(error = %e, class = %e.class(), exit_code = status.code(), "One-shot cycle failed");
            status
        },
    }
}

