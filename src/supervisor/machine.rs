//! Per-share supervision state machine.
//!
//! A supervisor is advanced once per scheduler tick. Within a tick it keeps
//! stepping until it reaches a resting point, so a healthy share goes
//! `Unmounted → PreparingMount → Mounting → Mounted` in one pass and a stale
//! share is unmounted and remounted in the tick that detected it. All effects
//! go through [`HostAdapters`]; the machine itself only decides.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::core::config::ShareConfig;
use crate::core::errors::{NfsmError, Result};
use crate::logger::jsonl::Severity;
use crate::mount::probe::ProbeOutcome;
use crate::supervisor::HostAdapters;
use crate::supervisor::report::{EventSink, Outcome, ShareEvent};
use crate::supervisor::state::{SharePhase, ShareSnapshot, ShareState, backoff_ticks};

/// Upper bound on phase steps within a single tick. The longest legitimate
/// chain (stale detection through remount and container start) is 10.
const MAX_STEPS_PER_TICK: usize = 16;

enum Step {
    Continue,
    Rest,
}

/// What already happened during the current tick.
#[derive(Debug, Default)]
struct TickContext {
    health_checked: bool,
    reached_mounted: bool,
    container_attempted: bool,
}

pub struct ShareSupervisor {
    share: ShareConfig,
    host: HostAdapters,
    sink: Arc<dyn EventSink>,
    max_backoff_factor: u32,
    state: ShareState,
    /// First tick at which `Unmounted`/`Failed` may attempt a mount again.
    retry_at_tick: u64,
    /// Container confirmed running since the last successful mount.
    container_confirmed: bool,
    /// We stopped the container during the current mount cycle. Cleared when
    /// the cycle ends in `Failed`, so every retry stops it again.
    container_stopped: bool,
    updated_at: String,
}

impl ShareSupervisor {
    #[must_use]
    pub fn new(
        share: ShareConfig,
        host: HostAdapters,
        sink: Arc<dyn EventSink>,
        max_backoff_factor: u32,
    ) -> Self {
        Self {
            share,
            host,
            sink,
            max_backoff_factor,
            state: ShareState::default(),
            retry_at_tick: 0,
            container_confirmed: false,
            container_stopped: false,
            updated_at: now_rfc3339(),
        }
    }

    #[must_use]
    pub fn share(&self) -> &ShareConfig {
        &self.share
    }

    #[must_use]
    pub fn state(&self) -> &ShareState {
        &self.state
    }

    #[must_use]
    pub fn phase(&self) -> SharePhase {
        self.state.phase
    }

    #[must_use]
    pub fn retry_at_tick(&self) -> u64 {
        self.retry_at_tick
    }

    #[must_use]
    pub fn snapshot(&self) -> ShareSnapshot {
        ShareSnapshot {
            name: self.share.name.clone(),
            local_path: self.share.local_path.clone(),
            phase: self.state.phase,
            consecutive_failures: self.state.consecutive_failures,
            last_error: self.state.last_error.clone(),
            updated_at: self.updated_at.clone(),
        }
    }

    /// Advance the machine for scheduler tick number `tick`.
    pub fn tick(&mut self, tick: u64) {
        self.tick_while(tick, || true);
    }

    /// Like [`tick`](Self::tick), but `keep_going` is consulted before every
    /// step and the tick ends early once it returns false. No further host
    /// effect is started after that.
    pub fn tick_while(&mut self, tick: u64, keep_going: impl Fn() -> bool) {
        let mut ctx = TickContext::default();
        for _ in 0..MAX_STEPS_PER_TICK {
            if !keep_going() {
                return;
            }
            if matches!(self.step(tick, &mut ctx), Step::Rest) {
                return;
            }
        }
        self.sink.notice(
            Severity::Warning,
            &format!(
                "share {} did not settle within one tick (phase {})",
                self.share.name, self.state.phase
            ),
        );
    }

    /// Drive the share to `Unmounted`: stop its container, force-unmount.
    ///
    /// Returns the unmount error, if any, after recording the transition.
    pub fn shutdown(&mut self) -> Result<()> {
        let from = self.state.phase;
        let mut notes = Vec::new();
        let container = self.share.container().map(str::to_owned);
        if let Some(id) = &container {
            match self.host.containers.stop(id) {
                Ok(()) => {
                    self.container_stopped = true;
                    notes.push(format!("stopped container {id}"));
                }
                Err(e) => notes.push(format!("container stop failed: {}", e.summary())),
            }
        }

        let result = self.host.operator.force_unmount(&self.share.local_path);
        let outcome = match &result {
            Ok(()) => {
                notes.push("unmounted".to_string());
                Outcome::Ok
            }
            Err(e) => {
                notes.push(format!("unmount failed: {}", e.summary()));
                Outcome::Failed
            }
        };
        self.container_confirmed = false;
        self.set_phase(SharePhase::Unmounted);
        let mut event = ShareEvent::new(&self.share.name, from, SharePhase::Unmounted, outcome)
            .with_detail(format!("shutdown: {}", notes.join("; ")));
        event.container = container;
        self.sink.report(event);
        result
    }

    /// Recover after a panic escaped a tick: forget in-flight progress and
    /// retry from `Unmounted` after the usual backoff.
    pub fn reset(&mut self, tick: u64, reason: &str) {
        let from = self.state.phase;
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.last_error = Some(reason.to_string());
        let wait = backoff_ticks(self.state.consecutive_failures, self.max_backoff_factor);
        self.retry_at_tick = tick.saturating_add(wait);
        self.container_confirmed = false;
        self.container_stopped = false;
        self.set_phase(SharePhase::Unmounted);
        self.sink.report(
            ShareEvent::new(&self.share.name, from, SharePhase::Unmounted, Outcome::Failed)
                .with_detail(format!("{reason}; retry in {wait} tick(s)")),
        );
    }

    fn step(&mut self, tick: u64, ctx: &mut TickContext) -> Step {
        match self.state.phase {
            SharePhase::Unmounted => self.step_unmounted(tick),
            SharePhase::PreparingMount => self.step_preparing_mount(),
            SharePhase::Mounting => self.step_mounting(tick, ctx),
            SharePhase::Mounted => self.step_mounted(ctx),
            SharePhase::StartingContainer => self.step_starting_container(ctx),
            SharePhase::CheckingHealth => self.step_checking_health(ctx),
            SharePhase::Stale => {
                self.advance(SharePhase::Remounting, Outcome::Ok, None);
                Step::Continue
            }
            SharePhase::Remounting => self.step_remounting(tick),
            SharePhase::Failed => {
                if tick < self.retry_at_tick {
                    return Step::Rest;
                }
                self.advance(
                    SharePhase::Unmounted,
                    Outcome::Ok,
                    Some("backoff elapsed, retrying".to_string()),
                );
                Step::Continue
            }
        }
    }

    fn step_unmounted(&mut self, tick: u64) -> Step {
        if tick < self.retry_at_tick {
            return Step::Rest;
        }
        let mut outcome = Outcome::Ok;
        let mut detail = None;
        let mut acted_on = None;
        if let Some(id) = self.share.container().map(str::to_owned)
            && !self.container_stopped
        {
            match self.host.containers.stop(&id) {
                Ok(()) => {
                    self.container_stopped = true;
                    self.container_confirmed = false;
                    detail = Some(format!("stopped container {id}"));
                }
                Err(e) => {
                    outcome = Outcome::Degraded;
                    detail = Some(format!("container stop failed, continuing: {}", e.summary()));
                }
            }
            acted_on = Some(id);
        }
        self.advance_with(SharePhase::PreparingMount, outcome, detail, acted_on);
        Step::Continue
    }

    fn step_preparing_mount(&mut self) -> Step {
        if !self.share.delete_on_mount {
            self.advance(SharePhase::Mounting, Outcome::Ok, None);
            return Step::Continue;
        }

        let path = self.share.local_path.clone();
        let (outcome, detail) = match self.host.probe.probe(&path) {
            ProbeOutcome::NotMounted => match self.host.operator.clear_directory(&path) {
                Ok(summary) if summary.is_complete() => (
                    Outcome::Ok,
                    format!("cleared {} local entries", summary.removed),
                ),
                Ok(summary) => {
                    let first = summary
                        .failed
                        .first()
                        .map(|(p, e)| format!("{}: {e}", p.display()))
                        .unwrap_or_default();
                    (
                        Outcome::Degraded,
                        format!(
                            "cleared {} local entries, {} could not be removed (first: {first})",
                            summary.removed,
                            summary.failed.len()
                        ),
                    )
                }
                Err(e @ NfsmError::SafetyVeto { .. }) => {
                    (Outcome::Vetoed, format!("clear refused: {}", e.summary()))
                }
                Err(e) => (Outcome::Degraded, format!("clear failed: {}", e.summary())),
            },
            observed => (
                Outcome::Vetoed,
                format!(
                    "clear refused: {} is {}, nothing deleted",
                    path.display(),
                    observed.describe()
                ),
            ),
        };
        self.advance(SharePhase::Mounting, outcome, Some(detail));
        Step::Continue
    }

    fn step_mounting(&mut self, tick: u64, ctx: &mut TickContext) -> Step {
        let path = self.share.local_path.clone();
        match self.host.probe.probe(&path) {
            ProbeOutcome::MountedHealthy => {
                self.on_mounted(ctx);
                self.advance(
                    SharePhase::Mounted,
                    Outcome::Ok,
                    Some("already mounted and healthy, adopted".to_string()),
                );
                return Step::Continue;
            }
            ProbeOutcome::MountedStale(reason) => {
                if let Err(e) = self.host.operator.force_unmount(&path) {
                    return self.mount_failed(
                        tick,
                        format!(
                            "stale mount ({reason}) could not be removed: {}",
                            e.summary()
                        ),
                    );
                }
            }
            ProbeOutcome::NotMounted => {}
        }

        if let Err(e) = self.host.operator.mount(&self.share) {
            return self.mount_failed(tick, e.summary());
        }

        match self.host.probe.probe(&path) {
            ProbeOutcome::MountedHealthy => {
                self.on_mounted(ctx);
                let detail = format!("mounted {}", self.share.source_spec());
                self.advance(SharePhase::Mounted, Outcome::Ok, Some(detail));
                Step::Continue
            }
            observed => {
                if let Err(e) = self.host.operator.force_unmount(&path) {
                    self.sink.notice(
                        Severity::Warning,
                        &format!(
                            "share {}: could not remove unresponsive fresh mount: {}",
                            self.share.name,
                            e.summary()
                        ),
                    );
                }
                self.mount_failed(
                    tick,
                    format!("mount reported success but share is {}", observed.describe()),
                )
            }
        }
    }

    fn step_mounted(&mut self, ctx: &mut TickContext) -> Step {
        if let Some(id) = self.share.container().map(str::to_owned)
            && !self.container_confirmed
            && !ctx.container_attempted
        {
            self.advance_with(SharePhase::StartingContainer, Outcome::Ok, None, Some(id));
            return Step::Continue;
        }
        if ctx.health_checked || ctx.reached_mounted {
            return Step::Rest;
        }
        self.set_phase(SharePhase::CheckingHealth);
        Step::Continue
    }

    fn step_starting_container(&mut self, ctx: &mut TickContext) -> Step {
        ctx.container_attempted = true;
        let Some(id) = self.share.container().map(str::to_owned) else {
            self.advance(SharePhase::Mounted, Outcome::Ok, None);
            return Step::Continue;
        };

        // Whatever happens next, the container is no longer known to be stopped.
        self.container_stopped = false;
        let (outcome, detail) = match self.host.containers.start(&id) {
            Ok(()) => match self.host.containers.is_running(&id) {
                Ok(true) => {
                    self.container_confirmed = true;
                    (Outcome::Ok, format!("started container {id}"))
                }
                Ok(false) => (
                    Outcome::Degraded,
                    format!("container {id} not running after start, will retry"),
                ),
                Err(e) => {
                    self.container_confirmed = true;
                    (
                        Outcome::Ok,
                        format!("started container {id}, state unknown: {}", e.summary()),
                    )
                }
            },
            Err(e) => (
                Outcome::Degraded,
                format!("container start failed, will retry: {}", e.summary()),
            ),
        };
        self.advance_with(SharePhase::Mounted, outcome, Some(detail), Some(id));
        Step::Continue
    }

    fn step_checking_health(&mut self, ctx: &mut TickContext) -> Step {
        ctx.health_checked = true;
        let reason = match self.host.probe.probe(&self.share.local_path) {
            ProbeOutcome::MountedHealthy => {
                self.set_phase(SharePhase::Mounted);
                return Step::Continue;
            }
            ProbeOutcome::MountedStale(reason) => format!("stale mount: {reason}"),
            ProbeOutcome::NotMounted => "mount disappeared from the mount table".to_string(),
        };
        self.state.last_error = Some(reason.clone());
        // The silent Mounted -> CheckingHealth hop is folded into this report.
        self.set_phase(SharePhase::Stale);
        let event = ShareEvent::new(
            &self.share.name,
            SharePhase::Mounted,
            SharePhase::Stale,
            Outcome::Failed,
        );
        self.sink
            .report(event.with_detail(format!("health check failed: {reason}")));
        Step::Continue
    }

    fn step_remounting(&mut self, tick: u64) -> Step {
        let mut outcome = Outcome::Ok;
        let mut notes = Vec::new();
        let mut acted_on = None;
        if let Some(id) = self.share.container().map(str::to_owned)
            && !self.container_stopped
        {
            match self.host.containers.stop(&id) {
                Ok(()) => {
                    self.container_stopped = true;
                    notes.push(format!("stopped container {id}"));
                }
                Err(e) => {
                    outcome = Outcome::Degraded;
                    notes.push(format!("container stop failed: {}", e.summary()));
                }
            }
            acted_on = Some(id);
        }
        self.container_confirmed = false;

        match self.host.operator.force_unmount(&self.share.local_path) {
            Ok(()) => notes.push("forced unmount".to_string()),
            Err(e) => {
                outcome = Outcome::Degraded;
                notes.push(format!("forced unmount failed, ignored: {}", e.summary()));
            }
        }

        self.retry_at_tick = tick;
        self.advance_with(
            SharePhase::Unmounted,
            outcome,
            Some(notes.join("; ")),
            acted_on,
        );
        Step::Continue
    }

    fn on_mounted(&mut self, ctx: &mut TickContext) {
        ctx.reached_mounted = true;
        self.state.consecutive_failures = 0;
        self.state.last_error = None;
        self.container_confirmed = false;
    }

    fn mount_failed(&mut self, tick: u64, reason: String) -> Step {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        let wait = backoff_ticks(self.state.consecutive_failures, self.max_backoff_factor);
        self.retry_at_tick = tick.saturating_add(wait);
        let detail = format!(
            "{reason} (failure {}, retry in {wait} tick(s))",
            self.state.consecutive_failures
        );
        self.state.last_error = Some(reason);
        self.container_stopped = false;
        self.advance(SharePhase::Failed, Outcome::Failed, Some(detail));
        Step::Rest
    }

    fn advance(&mut self, to: SharePhase, outcome: Outcome, detail: Option<String>) {
        self.advance_with(to, outcome, detail, None);
    }

    fn advance_with(
        &mut self,
        to: SharePhase,
        outcome: Outcome,
        detail: Option<String>,
        container: Option<String>,
    ) {
        let from = self.state.phase;
        self.set_phase(to);
        let mut event = ShareEvent::new(&self.share.name, from, to, outcome);
        event.detail = detail;
        event.container = container;
        self.sink.report(event);
    }

    /// Phase change without a report; used for the silent health fold-back.
    fn set_phase(&mut self, to: SharePhase) {
        debug_assert!(
            self.state.phase.can_transition_to(to),
            "illegal transition {} -> {to}",
            self.state.phase
        );
        self.state.phase = to;
        self.updated_at = now_rfc3339();
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
