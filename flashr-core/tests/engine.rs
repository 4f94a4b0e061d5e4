mod common;

use common::{ScriptedToolchain, engine, engine_with, notes, run_to_end, run_until};
use flashr_core::{
    AbortOutcome, EngineConfig, EngineError, OperationRequest, OperationState, Outcome, Phase,
    ProgressEvent, StartOutcome,
};
use std::fs;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const TICKING: &str = "while true; do echo tick; sleep 0.1; done";

#[test]
fn flash_is_synced_before_done() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img");
    let device = dir.path().join("device");
    let marker = dir.path().join("synced");
    fs::write(&image, b"image bytes").unwrap();

    let mut engine = engine(ScriptedToolchain {
        flash: "printf '10%%\\r50%%\\r100%%\\n'; cat {src} > {dst}".into(),
        sync_marker: Some(marker.clone()),
        ..Default::default()
    });
    let outcome = engine.start(OperationRequest::flash(&image, &device));
    assert!(matches!(outcome, StartOutcome::Started(_)));
    assert_eq!(engine.state(), OperationState::Running);

    let events = run_to_end(&mut engine);
    match events.last() {
        Some(ProgressEvent::Done {
            source,
            destination,
        }) => {
            assert_eq!(source, &image);
            assert_eq!(destination, &device);
        }
        other => panic!("expected Done, got {other:?}"),
    }
    assert!(marker.exists(), "sync must run before Done");
    assert_eq!(fs::read(&device).unwrap(), b"image bytes");

    let lines = notes(&events);
    assert!(lines[0].starts_with("> Starting flash of"));
    assert!(lines.contains(&"50%"));
    assert!(lines.contains(&"Sync completed successfully."));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Started(info) if info.phase == Phase::Primary))
    );

    assert_eq!(engine.state(), OperationState::Idle);
    assert!(engine.current().is_none());
    assert_eq!(engine.last_finished().unwrap().outcome, Outcome::Completed);
}

#[test]
fn failed_sync_is_not_done() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img");
    fs::write(&image, b"x").unwrap();

    let mut engine = engine(ScriptedToolchain {
        flash: "echo written".into(),
        sync_fails: true,
        ..Default::default()
    });
    engine.start(OperationRequest::flash(&image, dir.path().join("device")));
    let events = run_to_end(&mut engine);
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Done { .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Error(EngineError::Finalize { step: "sync", .. }))
    ));
    assert_eq!(engine.last_finished().unwrap().outcome, Outcome::Failed);
}

#[test]
fn unmount_failure_is_noted_and_flash_proceeds() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img");
    let device = dir.path().join("device");
    fs::write(&image, b"image bytes").unwrap();

    let mut engine = engine(ScriptedToolchain {
        flash: "cat {src} > {dst}".into(),
        unmount_fails: true,
        ..Default::default()
    });
    engine.start(OperationRequest::flash(&image, &device));
    let events = run_to_end(&mut engine);
    assert!(
        notes(&events)
            .iter()
            .any(|n| n.starts_with("Unmount error (ignored): umount") && n.ends_with("target is busy"))
    );
    assert!(matches!(events.last(), Some(ProgressEvent::Done { .. })));
    assert_eq!(fs::read(&device).unwrap(), b"image bytes");
}

#[test]
fn failed_pipeline_reports_decompressor_diagnostics() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img.xz");
    fs::write(&image, b"not really xz").unwrap();

    let mut engine = engine(ScriptedToolchain {
        flash: "echo 'xz: (stdin): File format not recognized' > {diag}; exit 1".into(),
        ..Default::default()
    });
    engine.start(OperationRequest::flash(&image, dir.path().join("device")));
    let events = run_to_end(&mut engine);
    match events.last() {
        Some(ProgressEvent::Error(err @ EngineError::Runtime { code: 1, .. })) => {
            assert!(err.to_string().contains("File format not recognized"));
        }
        other => panic!("expected runtime error, got {other:?}"),
    }
    // compressed size with no listing falls back to an inexact estimate
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::SizeEstimated(size) if !size.exact && size.bytes == 13 * 4
    )));
}

#[test]
fn extraction_renames_only_after_success() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img.xz");
    let output = dir.path().join("a.img");
    let partial = dir.path().join("a.img.part");
    fs::write(&image, b"compressed").unwrap();
    fs::write(&partial, b"stale from an earlier run").unwrap();
    fs::write(&output, b"old output").unwrap();

    let mut engine = engine(ScriptedToolchain {
        extract: "test ! -e {part} || exit 9; printf 'fresh' > {part}".into(),
        ..Default::default()
    });
    engine.start(OperationRequest::extract(&image));
    let events = run_to_end(&mut engine);
    match events.last() {
        Some(ProgressEvent::ExtractDone {
            source,
            destination,
        }) => {
            assert_eq!(source, &image);
            assert_eq!(destination, &output);
        }
        other => panic!("expected ExtractDone, got {other:?}"),
    }
    assert_eq!(fs::read(&output).unwrap(), b"fresh");
    assert!(!partial.exists());
    assert!(
        notes(&events)
            .iter()
            .any(|n| n.starts_with("Output file") && n.ends_with("already exists. Removing..."))
    );
}

#[test]
fn failed_extraction_leaves_nothing_behind() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img.xz");
    fs::write(&image, b"compressed").unwrap();

    let mut engine = engine(ScriptedToolchain {
        extract: "printf 'half' > {part}; exit 2".into(),
        ..Default::default()
    });
    engine.start(OperationRequest::extract(&image));
    let events = run_to_end(&mut engine);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Error(EngineError::Runtime { code: 2, .. }))
    ));
    assert!(!dir.path().join("a.img.part").exists());
    assert!(!dir.path().join("a.img").exists());
}

#[test]
fn extraction_of_raw_image_is_refused_and_source_kept() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img");
    fs::write(&image, b"precious raw image").unwrap();

    let mut engine = engine(ScriptedToolchain {
        extract: "false".into(),
        ..Default::default()
    });
    engine.start(OperationRequest::extract(&image));
    let events = run_to_end(&mut engine);
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Started(_))));
    match events.last() {
        Some(ProgressEvent::Error(err @ EngineError::Launch { .. })) => {
            assert!(err.to_string().contains("is not a compressed image"));
        }
        other => panic!("expected launch error, got {other:?}"),
    }
    assert_eq!(fs::read(&image).unwrap(), b"precious raw image");
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn extraction_onto_its_own_source_is_refused() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img.xz");
    fs::write(&image, b"compressed").unwrap();

    let mut engine = engine(ScriptedToolchain {
        extract: "printf 'x' > {part}".into(),
        ..Default::default()
    });
    engine.start(OperationRequest::extract_to(&image, &image));
    let events = run_to_end(&mut engine);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Error(EngineError::Launch { .. }))
    ));
    assert_eq!(fs::read(&image).unwrap(), b"compressed");
}

#[test]
fn extraction_honours_requested_destination() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img.xz");
    let output = dir.path().join("custom.img");
    fs::write(&image, b"compressed").unwrap();

    let mut engine = engine(ScriptedToolchain {
        extract: "printf 'fresh' > {part}".into(),
        ..Default::default()
    });
    engine.start(OperationRequest::extract_to(&image, &output));
    let events = run_to_end(&mut engine);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::ExtractDone { destination, .. }) if destination == &output
    ));
    assert_eq!(fs::read(&output).unwrap(), b"fresh");
    assert!(!dir.path().join("custom.img.part").exists());
    assert!(!dir.path().join("a.img").exists());
}

#[test]
fn abort_extraction_removes_partial_and_output() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img.xz");
    fs::write(&image, b"compressed").unwrap();

    let mut engine = engine(ScriptedToolchain {
        extract: format!("printf 'half' > {{part}}; {TICKING}"),
        ..Default::default()
    });
    engine.start(OperationRequest::extract(&image));
    run_until(&mut engine, |e| matches!(e, ProgressEvent::Progress(l) if l == "tick"));
    assert!(dir.path().join("a.img.part").exists());

    let requested = Instant::now();
    assert_eq!(engine.abort(), AbortOutcome::Scheduled);
    assert_eq!(engine.abort(), AbortOutcome::AlreadyAborting);
    assert_eq!(engine.state(), OperationState::Aborting);

    let events = run_to_end(&mut engine);
    assert!(matches!(events.last(), Some(ProgressEvent::AbortCompleted)));
    assert!(requested.elapsed() >= Duration::from_millis(500));
    assert!(!dir.path().join("a.img.part").exists());
    assert!(!dir.path().join("a.img").exists());
    assert_eq!(engine.state(), OperationState::Idle);
    assert_eq!(engine.last_finished().unwrap().outcome, Outcome::Aborted);
    assert_eq!(engine.abort(), AbortOutcome::NothingRunning);
}

#[test]
fn second_request_while_running_is_ignored() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img");
    fs::write(&image, b"x").unwrap();

    let mut engine = engine(ScriptedToolchain {
        flash: TICKING.into(),
        ..Default::default()
    });
    let StartOutcome::Started(first) =
        engine.start(OperationRequest::flash(&image, dir.path().join("device")))
    else {
        panic!("first request must start");
    };
    run_until(&mut engine, |e| matches!(e, ProgressEvent::Started(_)));
    let pid = engine.current().unwrap().pid;
    assert!(pid.is_some());

    assert_eq!(
        engine.start(OperationRequest::check(&image)),
        StartOutcome::Busy
    );
    let view = engine.current().unwrap();
    assert_eq!(view.id, first);
    assert_eq!(view.pid, pid);
    assert_eq!(view.state, OperationState::Running);

    engine.abort();
    assert_eq!(engine.start(OperationRequest::check(&image)), StartOutcome::Busy);
    run_to_end(&mut engine);

    // after the handshake the next operation gets a fresh channel
    let StartOutcome::Started(second) = engine.start(OperationRequest::check(&image)) else {
        panic!("engine must be free after abort");
    };
    assert_ne!(first, second);
    let events = run_to_end(&mut engine);
    assert!(notes(&events)[0].starts_with("> Starting integrity check of"));
    assert!(!notes(&events).contains(&"tick"));
    assert!(matches!(events.last(), Some(ProgressEvent::CheckDone { .. })));
}

#[test]
fn silent_pipeline_times_out_without_user_action() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img");
    fs::write(&image, b"x").unwrap();

    let config = EngineConfig {
        hang_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let mut engine = engine_with(
        config,
        ScriptedToolchain {
            flash: "echo begin; sleep 30".into(),
            ..Default::default()
        },
    );
    let started = Instant::now();
    engine.start(OperationRequest::flash(&image, dir.path().join("device")));
    let events = run_to_end(&mut engine);
    match events.last() {
        Some(ProgressEvent::Error(err)) => {
            assert!(err.is_timeout());
            assert_eq!(err.to_string(), "operation timed out - no progress for 1s");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(engine.state(), OperationState::Idle);
}

#[test]
fn chatty_pipeline_does_not_time_out() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img");
    fs::write(&image, b"x").unwrap();

    let config = EngineConfig {
        hang_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let mut engine = engine_with(
        config,
        ScriptedToolchain {
            flash: "for i in 1 2 3 4 5 6 7 8 9 10; do echo $i; sleep 0.3; done".into(),
            ..Default::default()
        },
    );
    engine.start(OperationRequest::flash(&image, dir.path().join("device")));
    let events = run_to_end(&mut engine);
    assert!(matches!(events.last(), Some(ProgressEvent::Done { .. })));
}

#[test]
fn missing_tool_fails_to_launch() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("a.img");
    fs::write(&image, b"x").unwrap();

    let mut engine = engine(ScriptedToolchain {
        requires: vec!["no-such-imaging-tool-flashr".into()],
        ..Default::default()
    });
    engine.start(OperationRequest::flash(&image, dir.path().join("device")));
    let events = run_to_end(&mut engine);
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Started(_))));
    match events.last() {
        Some(ProgressEvent::Error(err @ EngineError::Launch { .. })) => {
            assert!(err.to_string().contains("no-such-imaging-tool-flashr utility not found"));
        }
        other => panic!("expected launch error, got {other:?}"),
    }
    assert_eq!(engine.state(), OperationState::Idle);
}
