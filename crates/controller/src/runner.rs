//! Dispatcher, reconcile worker pool and periodic token sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshsync_core::{Error, ErrorClass, ReconcilerConfig, Result, WorkKey};
use meshsync_kubehub::{EventFilter, WatchSignal};
use meshsync_queue::{Backoff, WorkQueue};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::reconcile::Reconciler;
use crate::tokens::TokenReaper;

pub struct Runner {
    reconciler: Arc<Reconciler>,
    filter: EventFilter,
    queue: WorkQueue<WorkKey>,
    workers: usize,
    reconcile_timeout: Duration,
    resync_interval: Duration,
}

impl Runner {
    pub fn new(cfg: &ReconcilerConfig, reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            filter: EventFilter::from_config(cfg),
            queue: WorkQueue::new(Backoff::new(cfg.backoff_base, cfg.backoff_max)),
            workers: cfg.workers.max(1),
            reconcile_timeout: cfg.reconcile_timeout,
            resync_interval: cfg.resync_interval,
        }
    }

    /// Handle to the work queue, for enqueueing keys out of band.
    pub fn queue(&self) -> WorkQueue<WorkKey> { self.queue.clone() }

    /// Run until `shutdown` resolves or a fatal error occurs; the latter is
    /// returned. In-flight reconciles are allowed to finish either way.
    pub async fn run(self, signals: mpsc::Receiver<WatchSignal>, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(self.workers + 1);
        let sweep_now = Arc::new(Notify::new());

        let dispatcher =
            spawn_dispatcher(signals, self.filter.clone(), self.queue.clone(), sweep_now.clone(), fatal_tx.clone());
        let sweeper = self
            .reconciler
            .reaper()
            .map(|reaper| spawn_sweeper(reaper, self.resync_interval, sweep_now.clone(), fatal_tx.clone()));

        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: self.queue.clone(),
                    reconciler: self.reconciler.clone(),
                    timeout: self.reconcile_timeout,
                    fatal: fatal_tx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(fatal_tx);
        info!(workers = self.workers, "controller running");

        tokio::pin!(shutdown);
        let result = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                Ok(())
            }
            Some(e) = fatal_rx.recv() => {
                error!(error = %e, "fatal error; stopping controller");
                Err(e)
            }
        };

        self.queue.shutdown();
        dispatcher.abort();
        if let Some(s) = sweeper {
            s.abort();
        }
        for w in workers {
            if let Err(e) = w.await {
                warn!(error = %e, "reconcile worker ended abnormally");
            }
        }
        info!("controller stopped");
        result
    }
}

fn spawn_dispatcher(
    mut signals: mpsc::Receiver<WatchSignal>,
    filter: EventFilter,
    queue: WorkQueue<WorkKey>,
    sweep_now: Arc<Notify>,
    fatal: mpsc::Sender<Error>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            match signal {
                WatchSignal::Event(ev) => {
                    if let Some(key) = filter.on_event(&ev) {
                        debug!(key = %key, kind = ?ev.kind, "enqueue");
                        queue.add(key);
                    }
                }
                WatchSignal::Resynced { count } => {
                    debug!(count, "watch resynced; scheduling token sweep");
                    sweep_now.notify_one();
                }
                WatchSignal::Denied(msg) => {
                    let _ = fatal.send(Error::permission_denied(msg)).await;
                    return;
                }
            }
        }
        warn!("watch stream closed; no further events will be dispatched");
    })
}

fn spawn_sweeper(
    reaper: Arc<TokenReaper>,
    every: Duration,
    sweep_now: Arc<Notify>,
    fatal: mpsc::Sender<Error>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sweep_now.notified() => {}
            }
            let started = Instant::now();
            match reaper.cleanup_tokens(None).await {
                Ok(report) => {
                    info!(revoked = report.revoked, kept = report.kept, took_ms = %started.elapsed().as_millis(), "token sweep finished")
                }
                Err(e) if e.is_fatal() => {
                    let _ = fatal.send(e.context("token sweep")).await;
                    return;
                }
                Err(e) if e.class() == ErrorClass::DataCorruption => error!(error = %e, "token sweep aborted"),
                Err(e) => warn!(error = %e, "token sweep failed; retrying at next interval"),
            }
        }
    })
}

struct Worker {
    id: usize,
    queue: WorkQueue<WorkKey>,
    reconciler: Arc<Reconciler>,
    timeout: Duration,
    fatal: mpsc::Sender<Error>,
}

impl Worker {
    async fn run(self) {
        while let Some(key) = self.queue.get().await {
            let stop = self.process(&key).await;
            self.queue.done(&key);
            if stop {
                break;
            }
        }
        debug!(worker = self.id, "worker exiting");
    }

    /// Returns true when the worker should stop.
    async fn process(&self, key: &WorkKey) -> bool {
        let started = Instant::now();
        let res = match tokio::time::timeout(self.timeout, self.reconciler.reconcile(key)).await {
            Ok(res) => res,
            Err(_) => Err(Error::transient(format!("reconcile of {key} timed out after {:?}", self.timeout))),
        };
        metrics::counter!("reconcile_total", 1);
        metrics::histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);

        match res {
            Ok(outcome) => {
                self.queue.forget(key);
                debug!(worker = self.id, key = %key, ?outcome, took_ms = %started.elapsed().as_millis(), "reconciled");
                false
            }
            Err(e) => {
                metrics::counter!("reconcile_errors_total", 1);
                match e.class() {
                    ErrorClass::Fatal => {
                        error!(worker = self.id, key = %key, error = %e, "fatal reconcile error");
                        let _ = self.fatal.send(e).await;
                        true
                    }
                    class => {
                        let delay = self.queue.add_rate_limited(key.clone());
                        if class == ErrorClass::DataCorruption {
                            error!(worker = self.id, key = %key, error = %e, retry_in_ms = %delay.as_millis(), "reconcile failed on corrupt data");
                        } else {
                            warn!(worker = self.id, key = %key, error = %e, retry_in_ms = %delay.as_millis(), "reconcile failed; will retry");
                        }
                        false
                    }
                }
            }
        }
    }
}
