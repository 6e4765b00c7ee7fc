//! Activity logger: a dedicated thread owns the JSONL writer.
//!
//! Supervisors and the scheduler send [`ActivityEvent`]s through a bounded
//! crossbeam channel with `try_send()`, so a slow disk never stalls a share's
//! state machine. Events that do not fit are counted and the count is logged
//! with the next event that does.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::errors::{NfsmError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::supervisor::report::{EventSink, Outcome, ShareEvent};

const CHANNEL_CAPACITY: usize = 1024;
/// How long the logger idles before trying to get back to the primary file.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Events accepted by the logger thread.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
        shares: usize,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    Share(ShareEvent),
    Notice {
        severity: Severity,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Flush and exit the logger thread.
    Shutdown,
}

/// Cheaply cloneable, non-blocking handle to the logger thread.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Queue an event. If the channel is full the event is dropped and counted.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only until the
    /// sentinel is queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

impl EventSink for ActivityLoggerHandle {
    fn report(&self, event: ShareEvent) {
        self.send(ActivityEvent::Share(event));
    }

    fn notice(&self, severity: Severity, message: &str) {
        self.send(ActivityEvent::Notice {
            severity,
            message: message.to_string(),
        });
    }

    fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

/// Options for the logger thread.
#[derive(Debug, Clone)]
pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    /// Also print every entry to stderr for the service manager's journal.
    pub mirror_stderr: bool,
    pub channel_capacity: usize,
}

impl Default for ActivityLoggerConfig {
    fn default() -> Self {
        Self {
            jsonl: JsonlConfig::default(),
            mirror_stderr: true,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread. It runs until `handle.shutdown()` is called or
/// every handle has been dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("nfsm-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config, &dropped))
        .map_err(|e| NfsmError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(
    rx: &Receiver<ActivityEvent>,
    config: ActivityLoggerConfig,
    dropped: &AtomicU64,
) {
    let mirror_stderr = config.mirror_stderr;
    let mut jsonl = JsonlWriter::open(config.jsonl);
    let emit = |jsonl: &mut JsonlWriter, entry: &LogEntry| {
        if mirror_stderr {
            eprintln!("{}", entry.human_line());
        }
        jsonl.write_entry(entry);
    };

    loop {
        let event = match rx.recv_timeout(RECOVERY_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                jsonl.try_recover();
                jsonl.flush();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{lost} log events dropped due to back-pressure"));
            emit(&mut jsonl, &warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        emit(&mut jsonl, &event_to_log_entry(&event));
        // Events are sparse; keep the file current for `tail -f`.
        jsonl.flush();
    }

    jsonl.flush();
    jsonl.fsync();
}

fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::DaemonStarted {
            version,
            config_hash,
            shares,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStart, Severity::Info);
            e.details = Some(format!(
                "version={version} config_hash={config_hash} shares={shares}"
            ));
            e
        }
        ActivityEvent::DaemonStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e
        }
        ActivityEvent::Share(share_event) => share_event_entry(share_event),
        ActivityEvent::Notice { severity, message } => {
            let mut e = LogEntry::new(EventType::Notice, *severity);
            e.details = Some(message.clone());
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.details = Some(message.clone());
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::DaemonStop, Severity::Info),
    }
}

fn share_event_entry(event: &ShareEvent) -> LogEntry {
    let kind = if event.outcome == Outcome::Vetoed {
        EventType::ClearRefused
    } else if event.container.is_some() {
        EventType::ContainerAction
    } else {
        EventType::ShareTransition
    };
    let mut e = LogEntry::new(kind, event.outcome.severity());
    e.share = Some(event.share.clone());
    e.from = Some(event.from.to_string());
    e.to = Some(event.to.to_string());
    e.outcome = Some(event.outcome.as_str().to_string());
    e.container.clone_from(&event.container);
    e.details.clone_from(&event.detail);
    e
}
