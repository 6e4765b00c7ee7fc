//! Supervision scheduler: one worker thread per share, one tick clock.
//!
//! Threads:
//! - **Main**: owns the tick clock, hands tick numbers to workers, watches
//!   worker health, and writes `state.json`.
//! - **Share workers** (`nfsm-share-<name>`): each owns one
//!   [`ShareSupervisor`] and advances it whenever a tick arrives.
//! - **Logger**: see [`crate::logger::activity`].
//!
//! Ticks travel over a bounded(1) channel per share and are offered with
//! `try_send`. A share stuck in a hung mount keeps at most one tick queued and
//! skips the rest; every other share keeps its cadence. A panic inside a tick
//! is caught and the share is reset. A worker thread that dies anyway is
//! respawned, at most 3 times per 5 minutes, and retried after that window.
//!
//! Shutdown drops every tick sender. Each worker then drives its share to
//! `Unmounted` and reports back; whoever has not reported by the deadline is
//! abandoned.

#![allow(missing_docs)]

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use parking_lot::{Mutex, RwLock};

use crate::core::config::{Config, ShareConfig, SupervisionConfig, validate_shares};
use crate::core::errors::{NfsmError, Result};
use crate::daemon::signals::{ShutdownHandle, SignalHandler};
use crate::daemon::state_file::StateFileWriter;
use crate::logger::activity::{ActivityEvent, ActivityLoggerConfig, spawn_logger};
use crate::logger::jsonl::{JsonlConfig, Severity};
use crate::supervisor::{EventSink, HostAdapters, ShareSnapshot, ShareSupervisor};

/// Per-share tick queue: one tick may wait behind a busy worker, later ones
/// are skipped.
const TICK_CHANNEL_CAP: usize = 1;
/// Longest single sleep of the main loop, so shutdown is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ──────────────────── thread death tracking ────────────────────

const MAX_RESPAWNS: usize = 3;
const RESPAWN_WINDOW: Duration = Duration::from_secs(300);
const THREAD_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

struct ThreadHealth {
    deaths: Vec<Instant>,
}

impl ThreadHealth {
    fn new() -> Self {
        Self { deaths: Vec::new() }
    }

    fn record_death(&mut self, now: Instant) {
        self.deaths.push(now);
    }

    /// False while more than `MAX_RESPAWNS` deaths fall inside the window.
    fn may_respawn(&mut self, now: Instant) -> bool {
        self.deaths.retain(|t| now.duration_since(*t) < RESPAWN_WINDOW);
        self.deaths.len() <= MAX_RESPAWNS
    }
}

// ──────────────────── shared views ────────────────────

/// Latest snapshot of every share, keyed by name. Workers publish after each
/// tick; the main loop reads it for `state.json`.
pub type StatusBoard = Arc<RwLock<BTreeMap<String, ShareSnapshot>>>;

/// How the unmount-all at shutdown went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub unmounted: Vec<String>,
    /// Share name and failure summary.
    pub failed: Vec<(String, String)>,
    /// Shares whose worker did not finish before the shutdown deadline.
    pub abandoned: Vec<String>,
}

impl ShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }
}

#[derive(Debug)]
struct WorkerExit {
    name: String,
    result: std::result::Result<(), String>,
}

#[derive(Clone)]
struct WorkerContext {
    sink: Arc<dyn EventSink>,
    board: StatusBoard,
    done: Sender<WorkerExit>,
    /// Once set, no worker starts another step, even for a tick still queued.
    shutdown: ShutdownHandle,
}

// ──────────────────── share workers ────────────────────

struct ShareWorker {
    name: String,
    supervisor: Arc<Mutex<ShareSupervisor>>,
    tick_tx: Option<Sender<u64>>,
    join: Option<thread::JoinHandle<()>>,
    health: ThreadHealth,
    /// Consecutive ticks that found the queue full.
    busy_streak: u64,
    throttle_reported: bool,
}

impl ShareWorker {
    fn new(supervisor: ShareSupervisor) -> Self {
        Self {
            name: supervisor.share().name.clone(),
            supervisor: Arc::new(Mutex::new(supervisor)),
            tick_tx: None,
            join: None,
            health: ThreadHealth::new(),
            busy_streak: 0,
            throttle_reported: false,
        }
    }

    fn is_alive(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Start the worker thread. With `accept_ticks == false` the sender is
    /// dropped right away and the thread goes straight to shutdown.
    fn spawn(&mut self, ctx: &WorkerContext, accept_ticks: bool) -> Result<()> {
        let (tx, rx) = bounded::<u64>(TICK_CHANNEL_CAP);
        let supervisor = Arc::clone(&self.supervisor);
        let ctx = ctx.clone();
        let join = thread::Builder::new()
            .name(format!("nfsm-share-{}", self.name))
            .spawn(move || worker_main(&supervisor, &rx, &ctx))
            .map_err(|source| NfsmError::Runtime {
                details: format!("failed to spawn worker for share {}: {source}", self.name),
            })?;
        self.join = Some(join);
        self.tick_tx = accept_ticks.then_some(tx);
        Ok(())
    }

    /// Reap a dead thread and respawn it when the budget allows.
    fn ensure_running(&mut self, ctx: &WorkerContext, now: Instant) {
        if self.is_alive() {
            return;
        }
        if let Some(join) = self.join.take() {
            self.tick_tx = None;
            let detail = match join.join() {
                Ok(()) => "exited".to_string(),
                Err(payload) => format!("panicked: {}", panic_message(&*payload)),
            };
            self.health.record_death(now);
            ctx.sink.notice(
                Severity::Critical,
                &format!("worker for share {} {detail}", self.name),
            );
        }

        if !self.health.may_respawn(now) {
            if !self.throttle_reported {
                self.throttle_reported = true;
                ctx.sink.notice(
                    Severity::Critical,
                    &format!(
                        "worker for share {} died {} times within {}s; holding off respawn",
                        self.name,
                        self.health.deaths.len(),
                        RESPAWN_WINDOW.as_secs()
                    ),
                );
            }
            return;
        }

        match self.spawn(ctx, true) {
            Ok(()) => self.throttle_reported = false,
            Err(e) => {
                self.health.record_death(now);
                ctx.sink.notice(Severity::Critical, &e.to_string());
            }
        }
    }
}

fn worker_main(
    supervisor: &Mutex<ShareSupervisor>,
    ticks: &Receiver<u64>,
    ctx: &WorkerContext,
) {
    let name = supervisor.lock().share().name.clone();

    while let Ok(tick) = ticks.recv() {
        if ctx.shutdown.is_requested() {
            break;
        }
        let advanced = panic::catch_unwind(AssertUnwindSafe(|| {
            supervisor
                .lock()
                .tick_while(tick, || !ctx.shutdown.is_requested());
        }));
        if let Err(payload) = advanced {
            let reason = format!("supervisor panicked: {}", panic_message(&*payload));
            ctx.sink
                .notice(Severity::Critical, &format!("share {name}: {reason}"));
            supervisor.lock().reset(tick, &reason);
        }
        publish(&ctx.board, supervisor);
    }

    // Shutdown requested or tick sender dropped.
    let result = match panic::catch_unwind(AssertUnwindSafe(|| supervisor.lock().shutdown())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.summary()),
        Err(payload) => Err(format!(
            "panicked during shutdown: {}",
            panic_message(&*payload)
        )),
    };
    publish(&ctx.board, supervisor);
    let _ = ctx.done.send(WorkerExit { name, result });
}

fn publish(board: &StatusBoard, supervisor: &Mutex<ShareSupervisor>) {
    let snapshot = supervisor.lock().snapshot();
    board.write().insert(snapshot.name.clone(), snapshot);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ──────────────────── scheduler ────────────────────

/// Runs one [`ShareSupervisor`] per share until shutdown is requested.
pub struct SupervisionScheduler {
    workers: Vec<ShareWorker>,
    sink: Arc<dyn EventSink>,
    board: StatusBoard,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    shutdown: ShutdownHandle,
    state_writer: Option<StateFileWriter>,
}

impl SupervisionScheduler {
    /// Build supervisors for `shares`. Refuses overlapping mount points,
    /// duplicate names, and missing fields.
    pub fn new(
        shares: Vec<ShareConfig>,
        config: &SupervisionConfig,
        host: HostAdapters,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        validate_shares(&shares)?;
        if config.tick_interval_secs == 0 {
            return Err(NfsmError::InvalidConfig {
                details: "supervision.tick_interval_secs must be > 0".to_string(),
            });
        }

        let board: StatusBoard = Arc::new(RwLock::new(BTreeMap::new()));
        let workers = shares
            .into_iter()
            .map(|share| {
                let supervisor = ShareSupervisor::new(
                    share,
                    host.clone(),
                    Arc::clone(&sink),
                    config.max_backoff_factor,
                );
                let snapshot = supervisor.snapshot();
                board.write().insert(snapshot.name.clone(), snapshot);
                ShareWorker::new(supervisor)
            })
            .collect();

        Ok(Self {
            workers,
            sink,
            board,
            tick_interval: config.tick_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            shutdown: ShutdownHandle::new(),
            state_writer: None,
        })
    }

    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_state_file(mut self, writer: StateFileWriter) -> Self {
        self.state_writer = Some(writer);
        self
    }

    /// Trigger that makes [`run`](Self::run) return.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn status_board(&self) -> StatusBoard {
        Arc::clone(&self.board)
    }

    /// Supervise until shutdown is requested, then unmount everything within
    /// the shutdown timeout.
    pub fn run(mut self) -> ShutdownReport {
        let (done_tx, done_rx) = unbounded();
        let ctx = WorkerContext {
            sink: Arc::clone(&self.sink),
            board: Arc::clone(&self.board),
            done: done_tx,
            shutdown: self.shutdown.clone(),
        };

        let started = Instant::now();
        for worker in &mut self.workers {
            worker.ensure_running(&ctx, started);
        }

        let mut tick: u64 = 0;
        let mut next_tick = started;
        let mut last_health_check = started;

        while !self.shutdown.is_requested() {
            let now = Instant::now();
            if now >= next_tick {
                self.dispatch(tick);
                tick = tick.wrapping_add(1);
                next_tick = now + self.tick_interval;
            }

            if now.duration_since(last_health_check) >= THREAD_HEALTH_CHECK_INTERVAL {
                for worker in &mut self.workers {
                    worker.ensure_running(&ctx, now);
                }
                last_health_check = now;
            }

            self.write_state(false);

            let wait = next_tick
                .saturating_duration_since(Instant::now())
                .min(SLEEP_SLICE);
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }

        self.sink
            .notice(Severity::Info, "shutdown requested; unmounting all shares");
        self.drain(ctx, &done_rx)
    }

    fn dispatch(&mut self, tick: u64) {
        for worker in &mut self.workers {
            let Some(tx) = &worker.tick_tx else {
                continue;
            };
            match tx.try_send(tick) {
                Ok(()) => {
                    if worker.busy_streak > 0 {
                        self.sink.notice(
                            Severity::Info,
                            &format!(
                                "share {} caught up after skipping {} tick(s)",
                                worker.name, worker.busy_streak
                            ),
                        );
                    }
                    worker.busy_streak = 0;
                }
                Err(TrySendError::Full(_)) => {
                    worker.busy_streak += 1;
                    if worker.busy_streak == 1 {
                        self.sink.notice(
                            Severity::Warning,
                            &format!(
                                "share {} is still busy; skipping ticks until it finishes",
                                worker.name
                            ),
                        );
                    }
                }
                // Dead worker; the health check respawns it.
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    fn drain(mut self, ctx: WorkerContext, done_rx: &Receiver<WorkerExit>) -> ShutdownReport {
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut report = ShutdownReport::default();
        let mut pending = BTreeSet::new();

        for worker in &mut self.workers {
            worker.tick_tx = None;
            if !worker.is_alive() {
                if let Some(join) = worker.join.take() {
                    let _ = join.join();
                }
                // A dead worker still has a share to unmount.
                if let Err(e) = worker.spawn(&ctx, false) {
                    report.failed.push((worker.name.clone(), e.summary()));
                    continue;
                }
            }
            pending.insert(worker.name.clone());
        }
        drop(ctx);

        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done_rx.recv_timeout(remaining) {
                Ok(exit) => {
                    pending.remove(&exit.name);
                    match exit.result {
                        Ok(()) => report.unmounted.push(exit.name),
                        Err(detail) => report.failed.push((exit.name, detail)),
                    }
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        for worker in &mut self.workers {
            let Some(join) = worker.join.take() else {
                continue;
            };
            if !pending.contains(&worker.name) {
                let _ = join.join();
            } else if join.is_finished() {
                let _ = join.join();
                report.failed.push((
                    worker.name.clone(),
                    "worker exited before unmounting".to_string(),
                ));
            } else {
                // Detached: the thread is stuck in a host call.
                self.sink.notice(
                    Severity::Critical,
                    &format!(
                        "abandoning share {} after {:?} shutdown timeout",
                        worker.name, self.shutdown_timeout
                    ),
                );
                report.abandoned.push(worker.name.clone());
            }
        }

        self.write_state(true);
        report.unmounted.sort();
        report.failed.sort();
        report.abandoned.sort();
        report
    }

    fn write_state(&mut self, force: bool) {
        let Some(writer) = self.state_writer.as_mut() else {
            return;
        };
        if !force && !writer.is_due() {
            return;
        }
        let shares: Vec<ShareSnapshot> = self.board.read().values().cloned().collect();
        writer.write_now(shares, self.sink.dropped_events());
    }
}

// ──────────────────── daemon entry point ────────────────────

/// Run the daemon in the foreground until SIGTERM or SIGINT.
///
/// Wires the activity logger, the real host adapters, signal handling, and
/// the state file around a [`SupervisionScheduler`].
pub fn run_daemon(config: &Config) -> Result<ShutdownReport> {
    config.validate()?;
    let config_hash = config.stable_hash()?;
    let started = Instant::now();

    let (logger, logger_join) = spawn_logger(ActivityLoggerConfig {
        jsonl: JsonlConfig {
            path: config.paths.jsonl_log.clone(),
            ..JsonlConfig::default()
        },
        ..ActivityLoggerConfig::default()
    })?;
    logger.send(ActivityEvent::DaemonStarted {
        version: env!("CARGO_PKG_VERSION").to_string(),
        config_hash,
        shares: config.shares.len(),
    });

    let scheduler = HostAdapters::system(&config.supervision).and_then(|host| {
        SupervisionScheduler::new(
            config.shares.clone(),
            &config.supervision,
            host,
            Arc::new(logger.clone()),
        )
    });
    let scheduler = match scheduler {
        Ok(scheduler) => scheduler.with_state_file(StateFileWriter::new(
            config.paths.state_file.clone(),
            Duration::from_secs(config.supervision.state_write_interval_secs.max(1)),
        )),
        Err(e) => {
            logger.send(ActivityEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            });
            logger.shutdown();
            let _ = logger_join.join();
            return Err(e);
        }
    };

    let _signals = SignalHandler::install(scheduler.shutdown_handle());
    let report = scheduler.run();

    let reason = if report.is_clean() {
        "shutdown requested".to_string()
    } else {
        format!(
            "shutdown requested; {} share(s) failed to unmount, {} abandoned",
            report.failed.len(),
            report.abandoned.len()
        )
    };
    logger.send(ActivityEvent::DaemonStopped {
        reason,
        uptime_secs: started.elapsed().as_secs(),
    });
    logger.shutdown();
    let _ = logger_join.join();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SharePhase;
    use crate::testing::{FakeHost, RecordingSink, share};

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn phase_of(board: &StatusBoard, name: &str) -> Option<SharePhase> {
        board.read().get(name).map(|s| s.phase)
    }

    #[test]
    fn respawn_budget_is_per_window() {
        let mut health = ThreadHealth::new();
        let now = Instant::now();
        for _ in 0..MAX_RESPAWNS {
            health.record_death(now);
            assert!(health.may_respawn(now));
        }
        health.record_death(now);
        assert!(!health.may_respawn(now));
        assert!(health.may_respawn(now + RESPAWN_WINDOW));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let static_str: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*static_str), "boom");
        assert_eq!(panic_message(&*owned), "bang");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }

    #[test]
    fn overlapping_shares_are_refused() {
        let host = FakeHost::new();
        let err = SupervisionScheduler::new(
            vec![share("a", "/mnt/data"), share("b", "/mnt/data/sub")],
            &SupervisionConfig::default(),
            host.adapters(),
            RecordingSink::new(),
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), "NFSM-1001");
    }

    #[test]
    fn board_starts_unmounted() {
        let host = FakeHost::new();
        let scheduler = SupervisionScheduler::new(
            vec![share("a", "/mnt/a"), share("b", "/mnt/b")],
            &SupervisionConfig::default(),
            host.adapters(),
            RecordingSink::new(),
        )
        .unwrap();
        let board = scheduler.status_board();
        assert_eq!(phase_of(&board, "a"), Some(SharePhase::Unmounted));
        assert_eq!(phase_of(&board, "b"), Some(SharePhase::Unmounted));
    }

    #[test]
    fn mounts_everything_then_unmounts_on_shutdown() {
        let host = FakeHost::new();
        let sink = RecordingSink::new();
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let scheduler = SupervisionScheduler::new(
            vec![share("a", "/mnt/a"), share("b", "/mnt/b")],
            &SupervisionConfig::default(),
            host.adapters(),
            sink.clone(),
        )
        .unwrap()
        .with_tick_interval(Duration::from_millis(20))
        .with_state_file(StateFileWriter::new(
            state_path.clone(),
            Duration::from_secs(60),
        ));
        let board = scheduler.status_board();
        let shutdown = scheduler.shutdown_handle();
        let runner = thread::spawn(move || scheduler.run());

        assert!(wait_until(Duration::from_secs(5), || {
            phase_of(&board, "a") == Some(SharePhase::Mounted)
                && phase_of(&board, "b") == Some(SharePhase::Mounted)
        }));
        assert!(host.is_mounted("/mnt/a"));
        assert!(host.is_mounted("/mnt/b"));

        shutdown.request();
        let report = runner.join().unwrap();

        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.unmounted, vec!["a".to_string(), "b".to_string()]);
        assert!(!host.is_mounted("/mnt/a"));
        assert!(!host.is_mounted("/mnt/b"));
        assert_eq!(phase_of(&board, "a"), Some(SharePhase::Unmounted));

        let state = crate::daemon::state_file::read_state(&state_path).unwrap();
        assert_eq!(state.shares.len(), 2);
        assert!(state.shares.iter().all(|s| s.phase == SharePhase::Unmounted));
    }

    #[test]
    fn queued_tick_is_not_run_after_shutdown() {
        let host = FakeHost::new();
        host.fail_mounts_forever(true);
        host.set_mount_delay("/mnt/slow", Some(Duration::from_millis(300)));
        let config = SupervisionConfig {
            max_backoff_factor: 1,
            ..SupervisionConfig::default()
        };
        let scheduler = SupervisionScheduler::new(
            vec![share("slow", "/mnt/slow")],
            &config,
            host.adapters(),
            RecordingSink::new(),
        )
        .unwrap()
        .with_tick_interval(Duration::from_millis(20));
        let shutdown = scheduler.shutdown_handle();
        let runner = thread::spawn(move || scheduler.run());

        let mounts = || host.count(|e| matches!(e, crate::testing::Effect::Mount(_)));
        assert!(wait_until(Duration::from_secs(2), || mounts() == 1));
        // Let the scheduler queue the next tick behind the hung mount.
        thread::sleep(Duration::from_millis(60));
        shutdown.request();
        let report = runner.join().unwrap();

        assert_eq!(mounts(), 1, "{:?}", host.effects());
        assert_eq!(report.unmounted, vec!["slow".to_string()]);
        assert_eq!(
            host.effects().last(),
            Some(&crate::testing::Effect::ForceUnmount("/mnt/slow".into()))
        );
    }

    #[test]
    fn busy_share_skips_ticks_without_stalling_others() {
        let host = FakeHost::new();
        host.set_mount_delay("/mnt/slow", Some(Duration::from_millis(400)));
        let sink = RecordingSink::new();
        let scheduler = SupervisionScheduler::new(
            vec![share("slow", "/mnt/slow"), share("fast", "/mnt/fast")],
            &SupervisionConfig::default(),
            host.adapters(),
            sink.clone(),
        )
        .unwrap()
        .with_tick_interval(Duration::from_millis(20));
        let board = scheduler.status_board();
        let shutdown = scheduler.shutdown_handle();
        let runner = thread::spawn(move || scheduler.run());

        assert!(wait_until(Duration::from_millis(300), || {
            phase_of(&board, "fast") == Some(SharePhase::Mounted)
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            sink.notices()
                .iter()
                .any(|(_, msg)| msg.contains("share slow is still busy"))
        }));

        shutdown.request();
        let report = runner.join().unwrap();
        assert!(report.is_clean(), "{report:?}");
    }
}
