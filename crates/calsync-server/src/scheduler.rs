//! Background scheduler for source sync.
//!
//! One task per running scheduler: a cycle right away, then one per
//! interval. Commands arrive over a channel and are handled between cycles,
//! so a stop never interrupts a cycle in flight.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use calsync_core::CalendarSource;
use calsync_providers::QuotaManager;

use crate::error::ServerResult;
use crate::sync::SyncService;

/// Commands that can be sent to a running scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Run an extra cycle now.
    SyncNow,
    /// Finish the current cycle and exit.
    Stop,
}

struct Running {
    command_tx: mpsc::Sender<SchedulerCommand>,
    task: JoinHandle<()>,
}

/// Drives [`SyncService::sync_all`] on a fixed interval.
pub struct SyncScheduler {
    sync: SyncService,
    quota: Arc<QuotaManager>,
    configured: Vec<CalendarSource>,
    sync_enabled: bool,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl SyncScheduler {
    pub fn new(
        sync: SyncService,
        quota: Arc<QuotaManager>,
        configured: Vec<CalendarSource>,
        sync_enabled: bool,
        interval: Duration,
    ) -> Self {
        Self {
            sync,
            quota,
            configured,
            sync_enabled,
            interval,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bootstraps sources and starts the loop.
    ///
    /// With sync disabled only the bootstrap happens. Calling it while the
    /// loop runs does nothing.
    pub fn start(&self) -> ServerResult<()> {
        self.sync.sources().bootstrap(&self.configured)?;
        if !self.sync_enabled {
            info!("sync disabled, sources bootstrapped only");
            return Ok(());
        }

        let mut running = self.running();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("scheduler already running");
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel(16);
        let task = tokio::spawn(run_loop(
            self.sync.clone(),
            self.quota.clone(),
            self.interval,
            command_rx,
        ));
        *running = Some(Running { command_tx, task });
        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        Ok(())
    }

    /// Stops the loop and waits for an in-flight cycle to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        let _ = running.command_tx.send(SchedulerCommand::Stop).await;
        if let Err(e) = running.task.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
    }

    /// Queues an extra cycle. Returns false when the loop is not running.
    pub async fn sync_now(&self) -> bool {
        let Some(tx) = self.running().as_ref().map(|r| r.command_tx.clone()) else {
            return false;
        };
        tx.send(SchedulerCommand::SyncNow).await.is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("sync_enabled", &self.sync_enabled)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_loop(
    sync: SyncService,
    quota: Arc<QuotaManager>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<SchedulerCommand>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => run_cycle(&sync, &quota).await,
            cmd = command_rx.recv() => match cmd {
                Some(SchedulerCommand::SyncNow) => {
                    debug!("received SyncNow command");
                    run_cycle(&sync, &quota).await;
                }
                Some(SchedulerCommand::Stop) | None => {
                    info!("scheduler stopping");
                    break;
                }
            },
        }
    }
}

async fn run_cycle(sync: &SyncService, quota: &QuotaManager) {
    let evicted = quota.evict_idle();
    if evicted > 0 {
        debug!(evicted, "idle quota buckets evicted");
    }
    if let Err(e) = sync.sync_all().await {
        error!(error = %e, "sync cycle failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use calsync_core::{ConnectionParams, SourceType};
    use calsync_providers::{
        Adapters, BoxFuture, CalDavAdapter, CalendarAdapter, FetchOptions, FetchResult,
        ProviderResult, QuotaConfig,
    };

    use crate::store::Store;

    #[derive(Default)]
    struct CountingFeed {
        fetches: AtomicUsize,
    }

    impl CalendarAdapter for CountingFeed {
        fn name(&self) -> &str {
            "counting"
        }

        fn fetch_events<'a>(
            &'a self,
            _source: &'a CalendarSource,
            _options: FetchOptions,
        ) -> BoxFuture<'a, ProviderResult<FetchResult>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(FetchResult::default()) })
        }

        fn validate_source<'a>(&'a self, _source: &'a CalendarSource) -> BoxFuture<'a, bool> {
            Box::pin(async { true })
        }
    }

    fn scheduler(feed: Arc<CountingFeed>, sync_enabled: bool) -> SyncScheduler {
        let caldav = Arc::new(CalDavAdapter::new().unwrap());
        let adapters = Adapters {
            ics: feed,
            caldav: caldav.clone(),
            caldav_writer: caldav,
        };
        let store = Arc::new(Store::in_memory().unwrap());
        let source = CalendarSource::new(SourceType::Ics, "Feed", ConnectionParams::new("https://x/f.ics"));
        SyncScheduler::new(
            SyncService::new(store, adapters, 0),
            Arc::new(QuotaManager::new(QuotaConfig::default())),
            vec![source],
            sync_enabled,
            Duration::from_secs(900),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_per_interval() {
        let feed = Arc::new(CountingFeed::default());
        let scheduler = scheduler(feed.clone(), true);

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 2);

        assert!(scheduler.sync_now().await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 3);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 3);
        assert!(!scheduler.sync_now().await);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_sync_only_bootstraps() {
        let feed = Arc::new(CountingFeed::default());
        let scheduler = scheduler(feed.clone(), false);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1000)).await;

        assert!(!scheduler.is_running());
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.sync.sources().list().unwrap().len(), 1);
    }
}
