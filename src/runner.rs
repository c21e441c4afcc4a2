//! Load driver exercising budgets across workers.
//!
//! Every worker owns a partition of budgets credited with the configured
//! window. Its streams claim from the next worker's budgets and return every
//! granted amount to the owner as a window, so once the run stops and the
//! windows are drained each budget must be back at exactly its window.
//!
//! Shutdown runs in phases separated by barriers:
//! 1. stop claiming
//! 2. drain windows, check balances, release debitor registrations
//! 3. release budgets and close
//!
//! A worker that panics stops the run and still passes both barriers, so the
//! others finish their phases and the panic surfaces as a join failure.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::budget::{BudgetIndex, LayoutError};
use crate::config::{Config, ConfigError};
use crate::engine::{BudgetLayouts, BudgetWorker, WorkerError};
use crate::flow::notify::SignalBus;

/// Error type for runs.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Budget layout error: {0}")]
    Layout(#[from] LayoutError),

    #[error("Budget table of worker {0} exhausted")]
    Exhausted(usize),

    #[error("Budget {0:#018x} not found")]
    BudgetNotFound(u64),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Totals of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub workers: usize,
    pub budgets: usize,
    pub streams: usize,
    pub claims: u64,
    pub granted: u64,
    pub partial: u64,
    pub starved: u64,
    pub flushes: u64,
    pub elapsed_ms: u64,
    /// Every budget was back at its window after the drain.
    pub balanced: bool,
}

#[derive(Debug, Default)]
struct WorkerStats {
    claims: u64,
    granted: u64,
    partial: u64,
    starved: u64,
    flushes: u64,
    balanced: bool,
}

/// A consumer claiming from one budget under its own watcher id.
struct Stream {
    budget_id: u64,
    index: BudgetIndex,
    watcher_id: u64,
    ready: Arc<AtomicBool>,
    idle: u32,
}

/// Settings every worker thread needs.
#[derive(Debug, Clone, Copy)]
struct Limits {
    window: i64,
    min_claim: u32,
    max_claim: u32,
    idle_retry_polls: u32,
}

struct WorkerTask {
    worker: BudgetWorker,
    owned: Vec<(u64, BudgetIndex)>,
    streams: Vec<Stream>,
    flushes: Arc<AtomicU64>,
    limits: Limits,
    stopping: Arc<AtomicBool>,
    barrier: Arc<Barrier>,
}

/// Run workers until `shutdown_rx` signals, then drain and verify.
///
/// # Arguments
///
/// * `config` - Run configuration
/// * `shutdown_rx` - Receiver for shutdown signal
///
/// # Errors
///
/// Fails on invalid configuration, layout creation, budget exhaustion, and
/// budgets or registrations left behind at close.
pub async fn run(
    config: Config,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<RunReport, RunError> {
    config.validate()?;
    let (layouts, tasks, stopping) = prepare(&config)?;
    drive(&config, layouts, tasks, stopping, shutdown_rx).await
}

/// Map the tables, acquire and credit every budget and open the streams.
fn prepare(
    config: &Config,
) -> Result<(BudgetLayouts, Vec<WorkerTask>, Arc<AtomicBool>), RunError> {
    let layouts = match &config.directory {
        Some(directory) => {
            BudgetLayouts::create_in(directory, config.workers, config.budgets_capacity)?
        }
        None => BudgetLayouts::anonymous(config.workers, config.budgets_capacity)?,
    };
    let (bus, mailboxes) = SignalBus::new(config.workers);

    let mut workers: Vec<BudgetWorker> = mailboxes
        .into_iter()
        .map(|mailbox| {
            BudgetWorker::new(
                layouts.clone(),
                bus.clone(),
                mailbox,
                config.child_cleanup_linger(),
            )
        })
        .collect();

    let owned = workers
        .iter_mut()
        .map(|worker| acquire_budgets(worker, config.budgets_per_worker, config.window))
        .collect::<Result<Vec<_>, _>>()?;

    let limits = Limits {
        window: config.window,
        min_claim: config.min_claim,
        max_claim: config.max_claim,
        idle_retry_polls: config.idle_retry_polls,
    };
    let stopping = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(config.workers));

    let mut tasks = Vec::with_capacity(config.workers);
    for (index, worker) in workers.into_iter().enumerate() {
        let target = &owned[(index + 1) % config.workers];
        let flushes = Arc::new(AtomicU64::new(0));
        let mut task = WorkerTask {
            worker,
            owned: owned[index].clone(),
            streams: Vec::with_capacity(config.streams_per_worker),
            flushes,
            limits,
            stopping: Arc::clone(&stopping),
            barrier: Arc::clone(&barrier),
        };
        task.open_streams(target, config.streams_per_worker)?;
        tasks.push(task);
    }
    Ok((layouts, tasks, stopping))
}

async fn drive(
    config: &Config,
    layouts: BudgetLayouts,
    tasks: Vec<WorkerTask>,
    stopping: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<RunReport, RunError> {
    tracing::info!(
        workers = config.workers,
        budgets_per_worker = config.budgets_per_worker,
        streams_per_worker = config.streams_per_worker,
        window = config.window,
        "Starting budget workers"
    );

    let started = Instant::now();
    let handles: Vec<_> = tasks
        .into_iter()
        .map(|task| tokio::task::spawn_blocking(move || task.run()))
        .collect();

    if !*shutdown_rx.borrow() {
        let _ = shutdown_rx.changed().await;
    }
    tracing::info!("Shutdown signal received, stopping workers");
    stopping.store(true, Ordering::SeqCst);

    let mut report = RunReport {
        workers: config.workers,
        budgets: config.workers * config.budgets_per_worker,
        streams: config.workers * config.streams_per_worker,
        balanced: true,
        ..RunReport::default()
    };

    let mut failure = None;
    for handle in handles {
        match handle.await? {
            Ok(stats) => {
                report.claims += stats.claims;
                report.granted += stats.granted;
                report.partial += stats.partial;
                report.starved += stats.starved;
                report.flushes += stats.flushes;
                report.balanced &= stats.balanced;
            }
            Err(error) => {
                tracing::error!(error = %error, "Worker failed to close");
                failure.get_or_insert(error);
            }
        }
    }
    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    if let Some(error) = failure {
        return Err(error.into());
    }

    for owner in 0..layouts.len() {
        layouts.layout(owner).flush()?;
    }

    tracing::info!(
        claims = report.claims,
        granted = report.granted,
        flushes = report.flushes,
        balanced = report.balanced,
        "Workers stopped"
    );
    Ok(report)
}

fn acquire_budgets(
    worker: &mut BudgetWorker,
    count: usize,
    window: i64,
) -> Result<Vec<(u64, BudgetIndex)>, RunError> {
    (0..count)
        .map(|_| {
            let budget_id = worker.supply_budget_id();
            let index = worker
                .creditor_mut()
                .acquire(budget_id)
                .ok_or(RunError::Exhausted(worker.index()))?;
            worker.creditor().credit(0, index, window);
            Ok((budget_id, index))
        })
        .collect()
}

impl WorkerTask {
    fn open_streams(
        &mut self,
        target: &[(u64, BudgetIndex)],
        count: usize,
    ) -> Result<(), RunError> {
        if target.is_empty() {
            return Ok(());
        }

        let owner = self.worker.index() as u64;
        for stream in 0..count {
            let (budget_id, _) = target[stream % target.len()];
            let watcher_id = (owner << 32) | stream as u64;
            let ready = Arc::new(AtomicBool::new(true));

            let flusher = {
                let ready = Arc::clone(&ready);
                let flushes = Arc::clone(&self.flushes);
                move |_trace_id: u64| {
                    ready.store(true, Ordering::SeqCst);
                    flushes.fetch_add(1, Ordering::Relaxed);
                }
            };

            let index = self
                .worker
                .supply_debitor(budget_id)
                .acquire(budget_id, watcher_id, flusher)
                .ok_or(RunError::BudgetNotFound(budget_id))?;

            self.streams.push(Stream {
                budget_id,
                index,
                watcher_id,
                ready,
                idle: 0,
            });
        }
        Ok(())
    }

    fn run(mut self) -> Result<WorkerStats, WorkerError> {
        let index = self.worker.index();
        tracing::debug!(index, streams = self.streams.len(), "worker started");

        let mut stats = WorkerStats::default();
        let claiming = self.guarded(|task| task.claim_until_stopped(&mut stats));

        // Every window was sent before its sender reached the barrier.
        self.barrier.wait();
        let draining = claiming.and_then(|()| self.guarded(|task| task.drain(&mut stats)));

        self.barrier.wait();
        if let Err(panic) = draining {
            panic::resume_unwind(panic);
        }

        for &(_, budget_index) in &self.owned {
            self.worker.creditor_mut().release(budget_index);
        }
        while self.worker.poll(Instant::now()) != 0 {}

        stats.flushes = self.flushes.load(Ordering::Relaxed);
        tracing::debug!(
            index,
            claims = stats.claims,
            granted = stats.granted,
            balanced = stats.balanced,
            "worker stopped"
        );

        self.worker.close()?;
        Ok(stats)
    }

    /// Run one phase, stopping every worker if it panics.
    fn guarded(&mut self, phase: impl FnOnce(&mut Self)) -> std::thread::Result<()> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| phase(self)));
        if outcome.is_err() {
            tracing::error!(index = self.worker.index(), "Worker panicked, stopping run");
            self.stopping.store(true, Ordering::SeqCst);
        }
        outcome
    }

    fn claim_until_stopped(&mut self, stats: &mut WorkerStats) {
        let mut trace_id = (self.worker.index() as u64) << 56;

        while !self.stopping.load(Ordering::SeqCst) {
            let mut work = self.worker.poll(Instant::now());
            for stream in &mut self.streams {
                if !stream.ready.swap(false, Ordering::SeqCst)
                    && stream.idle < self.limits.idle_retry_polls
                {
                    stream.idle += 1;
                    continue;
                }

                trace_id += 1;
                stream.idle = 0;
                let claimed = self.worker.supply_debitor(stream.budget_id).claim(
                    trace_id,
                    stream.index,
                    stream.watcher_id,
                    self.limits.min_claim,
                    self.limits.max_claim,
                );

                stats.claims += 1;
                stats.granted += u64::from(claimed);
                if claimed == 0 {
                    stats.starved += 1;
                } else if claimed < self.limits.max_claim {
                    stats.partial += 1;
                }
                if claimed == self.limits.max_claim {
                    stream.ready.store(true, Ordering::SeqCst);
                }

                self.worker
                    .do_window(trace_id, stream.budget_id, i64::from(claimed));
                work += 1;
            }

            if work == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Drain returned windows, check balances and drop stream registrations.
    fn drain(&mut self, stats: &mut WorkerStats) {
        let index = self.worker.index();
        while self.worker.poll(Instant::now()) != 0 {}

        stats.balanced = self.owned.iter().all(|&(budget_id, budget_index)| {
            let remaining = self
                .worker
                .creditor()
                .layout()
                .slot(budget_index.slot(index))
                .remaining();
            if remaining != self.limits.window {
                tracing::warn!(budget_id, remaining, window = self.limits.window, "Budget unbalanced");
            }
            remaining == self.limits.window
        });

        for stream in &self.streams {
            self.worker
                .supply_debitor(stream.budget_id)
                .release(stream.index, stream.watcher_id);
        }
    }
}
