//! Warm VM pool.
//!
//! Keeps a queue of booted VMs so a caller can take one without waiting for
//! a cold boot. A background filler tops the queue up to `min_size`.
//!
//! # Example
//!
//! ```ignore
//! use paddock_core::{PoolConfig, VmPool};
//!
//! let mut pool = VmPool::new(PoolConfig::from_env(), launcher);
//! pool.start();
//!
//! let vm = pool.acquire().await?;
//! let snapshot = pool.release(vm).await?;
//!
//! pool.shutdown().await?;
//! ```

use crate::error::{CoreError, Result};
use crate::state::VmState;
use crate::vm::Vm;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

/// First vsock CID handed out by a pool, clear of CIDs assigned elsewhere.
pub const POOL_FIRST_CID: u32 = 10000;

/// Boots VMs for a [`VmPool`].
#[async_trait]
pub trait VmLauncher: Send + Sync + 'static {
    /// Boot one VM using `guest_cid` as its vsock CID.
    async fn launch(&self, guest_cid: u32) -> Result<Vm>;
}

/// Configuration for the VM pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Warm VMs to keep ready. Default: 3
    pub min_size: usize,

    /// Maximum concurrent boots while filling. Default: 2
    pub max_concurrent_boots: usize,

    /// How often the filler checks the pool level. Default: 1 second
    pub fill_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 3,
            max_concurrent_boots: 2,
            fill_interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PADDOCK_POOL_MIN_SIZE` | `3` |
    /// | `PADDOCK_POOL_MAX_BOOTS` | `2` |
    /// | `PADDOCK_POOL_FILL_INTERVAL_MS` | `1000` |
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            min_size: std::env::var("PADDOCK_POOL_MIN_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.min_size),
            max_concurrent_boots: std::env::var("PADDOCK_POOL_MAX_BOOTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_concurrent_boots),
            fill_interval: std::env::var("PADDOCK_POOL_FILL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.fill_interval),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_boots == 0 {
            return Err(CoreError::spec("max_concurrent_boots must be > 0"));
        }
        if self.fill_interval.is_zero() {
            return Err(CoreError::spec("fill_interval must be > 0"));
        }
        Ok(())
    }
}

/// Pool counters. Readable without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// VMs handed out from the warm queue
    pub warm_hits: AtomicU64,
    /// VMs booted on demand because the queue was empty
    pub cold_misses: AtomicU64,
    /// VMs booted by the filler
    pub created: AtomicU64,
    /// VMs shut down by the pool
    pub destroyed: AtomicU64,
    /// VMs handed back and released
    pub released: AtomicU64,
}

impl PoolStats {
    pub fn warm_hits(&self) -> u64 {
        self.warm_hits.load(Ordering::Relaxed)
    }

    pub fn cold_misses(&self) -> u64 {
        self.cold_misses.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Warm hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.warm_hits() as f64;
        let total = hits + self.cold_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            (hits / total) * 100.0
        }
    }
}

/// A pool of booted VMs.
pub struct VmPool {
    pool: Arc<Mutex<VecDeque<Vm>>>,
    config: PoolConfig,
    launcher: Arc<dyn VmLauncher>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    boot_semaphore: Arc<Semaphore>,
    filler_handle: Option<JoinHandle<()>>,
    stats: Arc<PoolStats>,
    cid_counter: Arc<AtomicU32>,
}

impl VmPool {
    /// Create a pool. Call [`start`](Self::start) to begin filling it.
    pub fn new(config: PoolConfig, launcher: Arc<dyn VmLauncher>) -> Self {
        tracing::info!(
            min_size = config.min_size,
            max_concurrent_boots = config.max_concurrent_boots,
            "creating vm pool"
        );
        Self {
            pool: Arc::new(Mutex::new(VecDeque::with_capacity(config.min_size))),
            boot_semaphore: Arc::new(Semaphore::new(config.max_concurrent_boots)),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            filler_handle: None,
            stats: Arc::new(PoolStats::default()),
            cid_counter: Arc::new(AtomicU32::new(POOL_FIRST_CID)),
            launcher,
            config,
        }
    }

    /// Start the background filler.
    pub fn start(&mut self) {
        if self.filler_handle.is_some() {
            tracing::warn!("pool filler already started");
            return;
        }

        let filler = Filler {
            pool: Arc::clone(&self.pool),
            config: self.config.clone(),
            launcher: Arc::clone(&self.launcher),
            shutdown: Arc::clone(&self.shutdown),
            shutdown_notify: Arc::clone(&self.shutdown_notify),
            semaphore: Arc::clone(&self.boot_semaphore),
            stats: Arc::clone(&self.stats),
            cid_counter: Arc::clone(&self.cid_counter),
        };
        self.filler_handle = Some(tokio::spawn(filler.run()));
        tracing::info!(min_size = self.config.min_size, "pool filler started");
    }

    /// Take a VM, booting one if the warm queue is empty.
    ///
    /// Pooled VMs that are no longer running are discarded.
    ///
    /// # Errors
    /// Returns the launcher's error on a cold boot.
    pub async fn acquire(&self) -> Result<Vm> {
        loop {
            let vm = self.pool.lock().await.pop_front();
            let Some(vm) = vm else {
                break;
            };

            if vm.state() == VmState::Running {
                self.stats.warm_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(vm_id = %vm.id(), "acquired vm from warm pool");
                return Ok(vm);
            }

            tracing::warn!(vm_id = %vm.id(), state = %vm.state(), "discarding dead vm from pool");
            self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.cold_misses.fetch_add(1, Ordering::Relaxed);
        tracing::info!("pool empty, booting on demand");
        let cid = self.cid_counter.fetch_add(1, Ordering::Relaxed);
        self.launcher.launch(cid).await
    }

    /// Hand a VM back. It is detached, not stopped; the returned snapshot
    /// lets another daemon pick it up with [`Vm::associate`].
    ///
    /// # Errors
    /// Returns an error if the VM cannot be dumped or is no longer running.
    pub async fn release(&self, vm: Vm) -> Result<Vec<u8>> {
        let data = vm.release().await?;
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        tracing::info!(vm_id = %vm.id(), bytes = data.len(), "vm handed back to pool");
        Ok(data)
    }

    /// Number of warm VMs.
    pub async fn size(&self) -> usize {
        self.pool.lock().await.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Whether the filler is running.
    pub fn is_running(&self) -> bool {
        self.filler_handle.is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Stop the filler and shut down every pooled VM. Failures are logged
    /// and do not stop the drain.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down vm pool");
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();

        if let Some(handle) = self.filler_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "pool filler panicked during shutdown");
            }
        }

        let vms: Vec<Vm> = std::mem::take(&mut *self.pool.lock().await).into();
        let count = vms.len();
        for vm in vms {
            self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = vm.shutdown().await {
                tracing::error!(vm_id = %vm.id(), error = %e, "failed to shut down pooled vm");
            }
        }

        tracing::info!(
            destroyed = count,
            warm_hits = self.stats.warm_hits(),
            cold_misses = self.stats.cold_misses(),
            hit_rate = format!("{:.1}%", self.stats.hit_rate()),
            "vm pool shut down"
        );
        Ok(())
    }
}

/// State moved into the filler task.
struct Filler {
    pool: Arc<Mutex<VecDeque<Vm>>>,
    config: PoolConfig,
    launcher: Arc<dyn VmLauncher>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    cid_counter: Arc<AtomicU32>,
}

impl Filler {
    async fn run(self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_notify.notified() => {
                    tracing::debug!("pool filler received shutdown");
                    break;
                }

                _ = tokio::time::sleep(self.config.fill_interval) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    self.fill().await;
                }
            }
        }
        tracing::debug!("pool filler exited");
    }

    async fn fill(&self) {
        let current = self.pool.lock().await.len();
        if current >= self.config.min_size {
            return;
        }
        let needed = self.config.min_size - current;
        tracing::debug!(current, target = self.config.min_size, needed, "pool below target");

        for _ in 0..needed {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                tracing::trace!("boot limit reached");
                break;
            };

            let pool = Arc::clone(&self.pool);
            let launcher = Arc::clone(&self.launcher);
            let stats = Arc::clone(&self.stats);
            let shutdown = Arc::clone(&self.shutdown);
            let min_size = self.config.min_size;
            let cid = self.cid_counter.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                let _permit = permit;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }

                let vm = match launcher.launch(cid).await {
                    Ok(vm) => vm,
                    Err(e) => {
                        tracing::warn!(guest_cid = cid, error = %e, "failed to boot vm for pool");
                        return;
                    }
                };

                let mut guard = pool.lock().await;
                if shutdown.load(Ordering::Relaxed) || guard.len() >= min_size {
                    drop(guard);
                    tracing::debug!(vm_id = %vm.id(), "pool full or closing, shutting down extra vm");
                    if let Err(e) = vm.shutdown().await {
                        tracing::warn!(vm_id = %vm.id(), error = %e, "failed to shut down extra vm");
                    }
                    return;
                }
                stats.created.fetch_add(1, Ordering::Relaxed);
                guard.push_back(vm);
                tracing::debug!(pool_size = guard.len(), "added vm to pool");
            });
        }
    }
}
