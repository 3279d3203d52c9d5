//! Adaptive polling of feed sources.
//!
//! Every source gets its own loop that wakes once per tick, and when due hands
//! a fetch job to a small shared pool. Results go through the dispatcher
//! before the next fetch of that source is scheduled, so a source never has
//! more than one fetch in flight.

mod backoff;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{stream, FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Config;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{AppError, Result};
use crate::feed::FeedFetch;
use crate::models::{FeedItem, FeedSource};
use crate::shutdown::ShutdownSignal;

pub use backoff::{BackoffPolicy, FetchState};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub policy: BackoffPolicy,
    pub fetch_timeout: Duration,
    pub tick: Duration,
    pub fetch_workers: usize,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: BackoffPolicy::from_config(config),
            fetch_timeout: config.fetch_timeout(),
            tick: config.tick(),
            fetch_workers: config.fetch_workers.max(1),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::default(),
            fetch_timeout: Duration::from_secs(5),
            tick: Duration::from_secs(1),
            fetch_workers: 3,
        }
    }
}

struct FetchJob {
    source: FeedSource,
    reply: oneshot::Sender<Result<Vec<FeedItem>>>,
}

struct FetchPool {
    jobs: mpsc::Sender<FetchJob>,
    workers: Vec<JoinHandle<()>>,
}

impl FetchPool {
    /// Jobs still queued when `shutdown` fires are dropped unstarted.
    fn spawn(fetcher: Arc<dyn FeedFetch>, workers: usize, timeout: Duration, shutdown: ShutdownSignal) -> Self {
        let (jobs, rx) = mpsc::channel::<FetchJob>(workers * 4);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..workers)
            .map(|_| {
                let fetcher = Arc::clone(&fetcher);
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let Some(job) = rx.lock().await.recv().await else {
                            break;
                        };
                        if shutdown.is_triggered() {
                            tracing::debug!(feed_id = %job.source.id, "shutting down, fetch not started");
                            continue;
                        }
                        let result = fetch_guarded(fetcher.as_ref(), &job.source, timeout).await;
                        // The source loop may have gone away during shutdown.
                        let _ = job.reply.send(result);
                    }
                })
            })
            .collect();

        Self { jobs, workers }
    }
}

/// Runs one fetch with a hard deadline, turning a panicking fetcher into an error.
async fn fetch_guarded(fetcher: &dyn FeedFetch, source: &FeedSource, timeout: Duration) -> Result<Vec<FeedItem>> {
    let fetch = AssertUnwindSafe(fetcher.fetch(source, timeout)).catch_unwind();
    match tokio::time::timeout(timeout, fetch).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(AppError::Other(anyhow::anyhow!("fetcher panicked on feed {}", source.id))),
        Err(_) => Err(AppError::FetchTimeout {
            feed_id: source.id.clone(),
            timeout,
        }),
    }
}

struct SourceLoop {
    handle: JoinHandle<()>,
    source: watch::Sender<FeedSource>,
}

#[derive(Default)]
struct Running {
    signal: Option<ShutdownSignal>,
    pool: Option<FetchPool>,
    loops: HashMap<String, SourceLoop>,
}

pub struct Scheduler {
    settings: SchedulerSettings,
    fetcher: Arc<dyn FeedFetch>,
    dispatcher: Arc<Dispatcher>,
    running: Mutex<Running>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, fetcher: Arc<dyn FeedFetch>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            settings,
            fetcher,
            dispatcher,
            running: Mutex::new(Running::default()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.lock().signal.is_some()
    }

    /// Starts polling `sources` until `signal` fires. Sources that already
    /// have a loop are left alone, so calling this again is harmless.
    /// Returns how many loops were started.
    pub fn start(&self, sources: Vec<FeedSource>, signal: ShutdownSignal) -> usize {
        let mut running = self.lock();
        if signal.is_triggered() {
            return 0;
        }
        if running.signal.is_none() {
            running.pool = Some(FetchPool::spawn(
                Arc::clone(&self.fetcher),
                self.settings.fetch_workers,
                self.settings.fetch_timeout,
                signal.clone(),
            ));
            running.signal = Some(signal);
            tracing::info!(workers = self.settings.fetch_workers, "scheduler started");
        }

        let mut started = 0;
        for source in sources {
            if self.spawn_loop(&mut running, source) {
                started += 1;
            }
        }
        started
    }

    /// Applies a new or changed source to a running scheduler.
    pub fn upsert_source(&self, source: FeedSource) {
        let mut running = self.lock();
        if let Some(existing) = running.loops.get(&source.id) {
            existing.source.send_replace(source);
            return;
        }
        if running.signal.is_some() {
            self.spawn_loop(&mut running, source);
        }
    }

    fn spawn_loop(&self, running: &mut Running, source: FeedSource) -> bool {
        if running.loops.contains_key(&source.id) {
            return false;
        }
        let (Some(signal), Some(pool)) = (running.signal.clone(), running.pool.as_ref()) else {
            return false;
        };
        if signal.is_triggered() {
            return false;
        }

        let feed_id = source.id.clone();
        let (source_tx, source_rx) = watch::channel(source);
        let handle = tokio::spawn(poll_source(
            source_rx,
            pool.jobs.clone(),
            Arc::clone(&self.dispatcher),
            self.settings.clone(),
            signal,
        ));
        tracing::debug!(feed_id = %feed_id, "polling loop started");
        running.loops.insert(
            feed_id,
            SourceLoop {
                handle,
                source: source_tx,
            },
        );
        true
    }

    /// Waits for every loop to exit after shutdown, then stops the fetch pool.
    pub async fn join(&self) {
        let (loops, pool) = {
            let mut running = self.lock();
            (std::mem::take(&mut running.loops), running.pool.take())
        };

        for (feed_id, source_loop) in loops {
            if let Err(e) = source_loop.handle.await {
                tracing::error!(feed_id = %feed_id, error = %e, "polling loop ended abnormally");
            }
        }

        if let Some(FetchPool { jobs, workers }) = pool {
            drop(jobs);
            for worker in workers {
                let _ = worker.await;
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Fetches and dispatches every source once, outside the polling loops.
    pub async fn fetch_all_once(&self, sources: Vec<FeedSource>) -> DispatchReport {
        let timeout = self.settings.fetch_timeout;
        stream::iter(sources)
            .map(|source| async move {
                match fetch_guarded(self.fetcher.as_ref(), &source, timeout).await {
                    Ok(items) => {
                        tracing::debug!(feed_id = %source.id, items = items.len(), "fetched");
                        self.dispatcher.dispatch(&source.id, items.into()).await
                    }
                    Err(e) => {
                        tracing::warn!(feed_id = %source.id, error = %e, "fetch failed");
                        DispatchReport::default()
                    }
                }
            })
            .buffer_unordered(self.settings.fetch_workers)
            .fold(DispatchReport::default(), |mut total, report| async move {
                total += report;
                total
            })
            .await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn poll_source(
    mut source: watch::Receiver<FeedSource>,
    jobs: mpsc::Sender<FetchJob>,
    dispatcher: Arc<Dispatcher>,
    settings: SchedulerSettings,
    mut shutdown: ShutdownSignal,
) {
    let mut state = FetchState::new(settings.policy, Instant::now());
    let mut ticker = tokio::time::interval(settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            _ = ticker.tick() => {}
        }
        if shutdown.is_triggered() {
            break;
        }
        if !state.is_due(Instant::now()) {
            continue;
        }

        let current = source.borrow_and_update().clone();
        let (reply, response) = oneshot::channel();
        let job = FetchJob {
            source: current.clone(),
            reply,
        };
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            sent = jobs.send(job) => if sent.is_err() { break },
        }

        let Ok(result) = response.await else {
            break;
        };
        match result {
            Ok(items) => {
                if state.on_success() {
                    tracing::debug!(feed_id = %current.id, interval = ?state.interval(), "polling faster");
                }
                if !items.is_empty() {
                    dispatcher.dispatch(&current.id, items.into()).await;
                }
            }
            Err(e) => {
                state.on_failure();
                if e.is_transient() {
                    tracing::warn!(
                        feed_id = %current.id,
                        failures = state.consecutive_failures(),
                        interval = ?state.interval(),
                        error = %e,
                        "fetch failed, backing off"
                    );
                } else {
                    tracing::error!(
                        feed_id = %current.id,
                        failures = state.consecutive_failures(),
                        interval = ?state.interval(),
                        error = %e,
                        "fetch failed unexpectedly, backing off"
                    );
                }
            }
        }
        state.schedule_next(Instant::now());
    }
    tracing::debug!(feed_id = %source.borrow().id, "polling loop stopped");
}
