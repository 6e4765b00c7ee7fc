//! Multi-tick supervision scenarios driven through the public API with the
//! in-memory host.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use nfs_mount_supervisor::core::config::ShareConfig;
use nfs_mount_supervisor::logger::activity::{ActivityLoggerConfig, spawn_logger};
use nfs_mount_supervisor::logger::jsonl::JsonlConfig;
use nfs_mount_supervisor::mount::probe::ProbeOutcome;
use nfs_mount_supervisor::supervisor::{EventSink, Outcome, SharePhase, ShareSupervisor};
use nfs_mount_supervisor::testing::{Effect, FakeHost, RecordingSink, share};

fn supervise(cfg: ShareConfig, host: &FakeHost, sink: &Arc<RecordingSink>) -> ShareSupervisor {
    ShareSupervisor::new(cfg, host.adapters(), Arc::clone(sink) as Arc<dyn EventSink>, 16)
}

fn media() -> ShareConfig {
    let mut cfg = share("media", "/mnt/media");
    cfg.docker = "jellyfin".to_string();
    cfg.delete_on_mount = true;
    cfg
}

fn mount_ticks(host: &FakeHost, sup: &mut ShareSupervisor, ticks: std::ops::Range<u64>) -> Vec<u64> {
    let mut attempts = Vec::new();
    for tick in ticks {
        let before = host.count(|e| matches!(e, Effect::Mount(_)));
        sup.tick(tick);
        if host.count(|e| matches!(e, Effect::Mount(_))) > before {
            attempts.push(tick);
        }
    }
    attempts
}

#[test]
fn server_outage_backs_off_exponentially_then_recovers() {
    let host = FakeHost::new();
    host.fail_mounts(3);
    let sink = RecordingSink::new();
    let mut sup = supervise(share("docs", "/mnt/docs"), &host, &sink);

    let attempts = mount_ticks(&host, &mut sup, 0..20);

    // Waits of 2, 4, then 8 ticks after the first three failures.
    assert_eq!(attempts, vec![0, 2, 6, 14]);
    assert_eq!(sup.phase(), SharePhase::Mounted);
    assert_eq!(sup.state().consecutive_failures, 0);
    assert!(sup.state().last_error.is_none());
    let failures = sink
        .events()
        .iter()
        .filter(|e| e.to == SharePhase::Failed)
        .count();
    assert_eq!(failures, 3);
}

#[test]
fn permanent_outage_keeps_retrying_at_the_cap() {
    let host = FakeHost::new();
    host.fail_mounts_forever(true);
    let sink = RecordingSink::new();
    let mut sup = ShareSupervisor::new(
        share("docs", "/mnt/docs"),
        host.adapters(),
        Arc::clone(&sink) as Arc<dyn EventSink>,
        4,
    );

    let attempts = mount_ticks(&host, &mut sup, 0..40);

    assert_eq!(&attempts[..4], &[0, 2, 6, 10]);
    for pair in attempts[3..].windows(2) {
        assert_eq!(pair[1] - pair[0], 4, "attempts: {attempts:?}");
    }
    assert_eq!(sup.phase(), SharePhase::Failed);
    assert!(sup.state().consecutive_failures >= 10);
}

#[test]
fn container_is_never_running_while_the_mount_point_changes() {
    let host = FakeHost::new();
    host.set_container_running("jellyfin");
    host.fail_mounts(1);
    let sink = RecordingSink::new();
    let mut sup = supervise(media(), &host, &sink);

    for tick in 0..30 {
        match tick {
            8 => host.mark_stale("/mnt/media", "Stale file handle"),
            15 => host.drop_mount("/mnt/media"),
            _ => {}
        }
        sup.tick(tick);
    }

    let mut running = true;
    for effect in host.effects() {
        match effect {
            Effect::StopContainer(_) => running = false,
            Effect::StartContainer(_) => running = true,
            Effect::Clear(_) | Effect::Mount(_) | Effect::ForceUnmount(_) => {
                assert!(!running, "{effect:?} while container running: {:?}", host.effects());
            }
        }
    }
    assert_eq!(sup.phase(), SharePhase::Mounted);
    assert!(host.is_container_running("jellyfin"));
}

#[test]
fn clear_is_refused_whenever_the_probe_sees_a_mount() {
    for forced in [
        ProbeOutcome::MountedHealthy,
        ProbeOutcome::MountedStale("Input/output error".to_string()),
    ] {
        let host = FakeHost::new();
        host.force_probe(Some(forced.clone()));
        host.fail_mounts_forever(true);
        let sink = RecordingSink::new();
        let mut sup = supervise(media(), &host, &sink);

        sup.tick(0);

        assert_eq!(host.count(|e| matches!(e, Effect::Clear(_))), 0);
        let vetoes: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.outcome == Outcome::Vetoed)
            .collect();
        assert_eq!(vetoes.len(), 1, "probe {forced:?}");
        assert_eq!(vetoes[0].from, SharePhase::PreparingMount);
        assert_eq!(vetoes[0].to, SharePhase::Mounting);
    }
}

#[test]
fn shares_on_one_host_do_not_interfere() {
    let host = FakeHost::new();
    let sink = RecordingSink::new();
    let mut docs = supervise(share("docs", "/mnt/docs"), &host, &sink);
    let mut photos = supervise(share("photos", "/mnt/photos"), &host, &sink);

    docs.tick(0);
    photos.tick(0);
    host.mark_stale("/mnt/photos", "Stale file handle");
    host.clear_effects();
    docs.tick(1);
    photos.tick(1);

    assert_eq!(docs.phase(), SharePhase::Mounted);
    assert_eq!(photos.phase(), SharePhase::Mounted);
    let docs_path = PathBuf::from("/mnt/docs");
    assert!(host.effects().iter().all(|e| match e {
        Effect::Mount(p) | Effect::ForceUnmount(p) | Effect::Clear(p) => *p != docs_path,
        _ => true,
    }));
    assert!(sink.transitions("docs").iter().all(|(_, to)| *to != SharePhase::Stale));
}

#[test]
fn transitions_land_in_the_activity_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("activity.jsonl");
    let (logger, join) = spawn_logger(ActivityLoggerConfig {
        jsonl: JsonlConfig {
            path: log_path.clone(),
            fallback_path: None,
            ..JsonlConfig::default()
        },
        mirror_stderr: false,
        ..ActivityLoggerConfig::default()
    })
    .unwrap();

    let host = FakeHost::new();
    host.set_mounted("/mnt/media");
    let mut sup = ShareSupervisor::new(media(), host.adapters(), Arc::new(logger.clone()), 16);
    sup.tick(0);
    drop(sup);
    logger.shutdown();
    join.join().unwrap();

    let lines: Vec<serde_json::Value> = fs::read_to_string(&log_path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let refused: Vec<_> = lines
        .iter()
        .filter(|l| l["event"] == "clear_refused")
        .collect();
    assert_eq!(refused.len(), 1, "{lines:#?}");
    assert_eq!(refused[0]["severity"], "critical");
    assert_eq!(refused[0]["share"], "media");
    assert!(lines.iter().all(|l| l["ts"].is_string()));
    assert!(
        lines
            .iter()
            .any(|l| l["event"] == "container_action" && l["container"] == "jellyfin")
    );
}
