//! Background pre-fetch of important locations.
//!
//! The collector walks the important-location list in small batches, fetching
//! whatever has no fresh cache entry. Every fetch goes through the
//! `RequestCoordinator` at `Low` priority, so a user action queued meanwhile
//! still runs first. One owned timer task drives the cycle; it stops at a
//! batch boundary when paused and goes idle once everything is cached.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{fetch_with_timeout, SnapshotSource};
use crate::cache::SharedStore;
use crate::coordinator::{Priority, RequestCoordinator};

/// Locations fetched per activation.
pub const DEFAULT_BATCH_SIZE: usize = 2;

/// Pause between two activations.
pub const DEFAULT_INTERVAL_SECS: u64 = 15;

/// Delay before a resumed collector starts again.
const RESUME_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorState {
    Idle,
    Collecting,
    Paused,
}

/// How far pre-fetching of important locations has come.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionProgress {
    pub total_important: usize,
    pub loaded_important: usize,
    pub in_progress: bool,
    pub paused: bool,
}

impl CollectionProgress {
    pub fn is_complete(&self) -> bool {
        self.loaded_important >= self.total_important
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    pub batch_size: usize,
    pub interval: Duration,
    pub resume_delay: Duration,
    /// Timeout for each background fetch. Background fetches are not retried.
    pub fetch_timeout: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            resume_delay: Duration::from_millis(RESUME_DELAY_MS),
            fetch_timeout: Duration::from_secs(crate::api::client::REQUEST_TIMEOUT_SECS),
        }
    }
}

#[derive(Default)]
struct Control {
    collecting: bool,
    paused: bool,
    /// Current run was started by a user request and ignores `paused`
    /// until the next explicit `pause()`.
    forced: bool,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    store: SharedStore,
    coordinator: Arc<RequestCoordinator>,
    source: Arc<dyn SnapshotSource>,
    settings: CollectorSettings,
    control: Mutex<Control>,
    progress: watch::Sender<CollectionProgress>,
}

pub struct BackgroundCollector {
    shared: Arc<Shared>,
}

impl BackgroundCollector {
    pub fn new(
        store: SharedStore,
        coordinator: Arc<RequestCoordinator>,
        source: Arc<dyn SnapshotSource>,
        settings: CollectorSettings,
    ) -> Self {
        let (progress, _) = watch::channel(CollectionProgress::default());
        Self {
            shared: Arc::new(Shared {
                store,
                coordinator,
                source,
                settings,
                control: Mutex::new(Control::default()),
                progress,
            }),
        }
    }

    /// Begin collecting. Returns whether a new run was started.
    ///
    /// A no-op while already collecting, and while paused unless `force` is set.
    pub fn start(&self, force: bool) -> bool {
        Shared::start(&self.shared, force)
    }

    /// Stop after the batch in flight.
    pub fn pause(&self) {
        {
            let mut control = self.shared.control();
            control.paused = true;
            control.forced = false;
        }
        info!("Background collection paused");
        self.shared.publish_flags();
    }

    /// Clear `paused` and start again shortly if not collecting and
    /// important locations are still missing.
    pub fn resume(&self) {
        let was_paused = {
            let mut control = self.shared.control();
            std::mem::replace(&mut control.paused, false)
        };
        self.shared.publish_flags();
        if was_paused {
            info!("Background collection resumed");
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(shared.settings.resume_delay).await;
            let progress = shared.refresh_progress().await;
            if !progress.is_complete() {
                Shared::start(&shared, false);
            }
        });
    }

    /// Cancel the timer task. Queued fetches already handed to the
    /// coordinator are unaffected.
    pub fn shutdown(&self) {
        let task = {
            let mut control = self.shared.control();
            control.collecting = false;
            control.forced = false;
            control.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.shared.publish_flags();
    }

    pub fn state(&self) -> CollectorState {
        let control = self.shared.control();
        if control.collecting {
            CollectorState::Collecting
        } else if control.paused {
            CollectorState::Paused
        } else {
            CollectorState::Idle
        }
    }

    /// Last published progress.
    pub fn progress(&self) -> CollectionProgress {
        *self.shared.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CollectionProgress> {
        self.shared.progress.subscribe()
    }

    /// Recount cached important locations, e.g. after a user fetch wrote one.
    pub async fn refresh_progress(&self) -> CollectionProgress {
        self.shared.refresh_progress().await
    }

    /// Wait until no run is in progress.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.subscribe();
        // Sender lives as long as `self`
        let _ = rx.wait_for(|p| !p.in_progress).await;
    }
}

impl Drop for BackgroundCollector {
    fn drop(&mut self) {
        if let Some(task) = self.shared.control().task.take() {
            task.abort();
        }
    }
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start(shared: &Arc<Self>, force: bool) -> bool {
        {
            let mut control = shared.control();
            if control.collecting {
                debug!("Collector already running");
                return false;
            }
            if control.paused && !force {
                debug!("Collector paused, not starting");
                return false;
            }
            control.collecting = true;
            control.forced = force;
            control.task = Some(tokio::spawn(Self::run(Arc::clone(shared))));
        }
        info!(forced = force, "Background collection started");
        shared.publish_flags();
        true
    }

    fn should_stop(&self) -> bool {
        let control = self.control();
        control.paused && !control.forced
    }

    /// Important locations without a fresh cache entry, in curated order.
    async fn not_cached(&self) -> Vec<String> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let important: Vec<String> = store.policy().important().iter().map(str::to_string).collect();
        important
            .into_iter()
            .filter(|id| store.load_at(id, now).is_none())
            .collect()
    }

    async fn refresh_progress(&self) -> CollectionProgress {
        let total = self.store.lock().await.policy().important().len();
        let missing = self.not_cached().await.len();
        let control = self.control();
        let progress = CollectionProgress {
            total_important: total,
            loaded_important: total - missing,
            in_progress: control.collecting,
            paused: control.paused,
        };
        drop(control);
        self.progress.send_replace(progress);
        progress
    }

    fn publish_flags(&self) {
        let (collecting, paused) = {
            let control = self.control();
            (control.collecting, control.paused)
        };
        self.progress.send_modify(|p| {
            p.in_progress = collecting;
            p.paused = paused;
        });
    }

    async fn run(shared: Arc<Self>) {
        // Locations that failed during this run are not retried until the next one
        let mut failed: HashSet<String> = HashSet::new();

        loop {
            if shared.should_stop() {
                info!("Collector stopping at batch boundary");
                break;
            }

            let pending = shared.not_cached().await;
            if pending.is_empty() {
                info!("All important locations cached");
                break;
            }

            let batch: Vec<String> = pending
                .into_iter()
                .filter(|id| !failed.contains(id))
                .take(shared.settings.batch_size)
                .collect();
            if batch.is_empty() {
                warn!(failed = failed.len(), "Only failed locations remain, collector going idle");
                break;
            }

            debug!(batch = ?batch, "Dispatching collection batch");
            let mut receivers = Vec::with_capacity(batch.len());
            for id in batch {
                let task = Self::fetch_and_store(Arc::clone(&shared), id.clone());
                let rx = shared
                    .coordinator
                    .submit(Priority::Low, format!("collect {}", id), task)
                    .await;
                receivers.push((id, rx));
            }

            for (id, rx) in receivers {
                match rx.await {
                    Ok(true) => {}
                    Ok(false) => {
                        failed.insert(id);
                    }
                    Err(_) => {
                        warn!("Request coordinator stopped, ending collection");
                        shared.finish().await;
                        return;
                    }
                }
            }

            if shared.not_cached().await.is_empty() {
                info!("All important locations cached");
                break;
            }
            if shared.should_stop() {
                info!("Collector stopping at batch boundary");
                break;
            }
            tokio::time::sleep(shared.settings.interval).await;
        }

        shared.finish().await;
    }

    async fn finish(&self) {
        {
            let mut control = self.control();
            control.collecting = false;
            control.forced = false;
            control.task = None;
        }
        let progress = self.refresh_progress().await;
        info!(
            loaded = progress.loaded_important,
            total = progress.total_important,
            "Background collection finished"
        );
    }

    /// One queued background fetch. Returns whether a snapshot was stored.
    async fn fetch_and_store(shared: Arc<Self>, location: String) -> bool {
        let result = fetch_with_timeout(shared.source.as_ref(), &location, shared.settings.fetch_timeout).await;
        let stored = match result {
            Ok(snapshot) => shared.store.lock().await.save(&location, snapshot),
            Err(e) => {
                warn!(location = %location, error = %e, "Background fetch failed, skipping");
                false
            }
        };
        shared.refresh_progress().await;
        stored
    }
}
