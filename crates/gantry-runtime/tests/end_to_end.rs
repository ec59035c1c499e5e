//! End-to-end scenarios: a full daemon over an in-process firmware
//! model.

mod common;

use common::{firmware_pair, test_config, write_file, FirmwareControl};
use gantry_runtime::{Command, CommandExecutor, CommandResponse, Daemon};
use gantry_types::{DaemonError, JobPhase, PauseReason};
use gantry_wire::{FirmwareRequest, PrintPausedPayload, SbcRequest};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Harness {
    executor: CommandExecutor,
    firmware: FirmwareControl,
    phase: watch::Receiver<JobPhase>,
    run: JoinHandle<Result<(), DaemonError>>,
    shutdown: tokio_util::sync::CancellationToken,
    dir: TempDir,
}

/// Boots a daemon wired to a fresh firmware model.
fn start_daemon() -> Harness {
    let dir = TempDir::new().unwrap();
    let (link, firmware) = firmware_pair();
    let mut daemon = Daemon::new(test_config(&dir));

    let executor = daemon.executor();
    let phase = daemon.job().phase_watch();
    let shutdown = daemon.cancel_token();
    let run = tokio::spawn(async move { daemon.run(link).await });

    Harness {
        executor,
        firmware,
        phase,
        run,
        shutdown,
        dir,
    }
}

async fn wait_phase(harness: &mut Harness, phase: JobPhase) {
    tokio::time::timeout(
        Duration::from_secs(10),
        harness.phase.wait_for(|p| *p == phase),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {phase}"))
    .expect("phase channel closed");
}

async fn wait_codes_seen(firmware: &FirmwareControl, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while firmware.codes_seen().len() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("firmware never saw {count} codes"));
}

async fn select_and_start(harness: &Harness, path: &Path) {
    harness
        .executor
        .execute(Command::SelectFile {
            name: path.to_path_buf(),
            simulating: false,
        })
        .await
        .unwrap();
    harness.executor.execute(Command::StartPrint).await.unwrap();
}

async fn job_status(executor: &CommandExecutor) -> serde_json::Value {
    match executor.execute(Command::Diagnostics).await.unwrap() {
        CommandResponse::Value(report) => report["job"].clone(),
        other => panic!("unexpected diagnostics response {other:?}"),
    }
}

async fn stop(harness: &mut Harness) {
    harness.shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), &mut harness.run)
        .await
        .expect("daemon did not stop")
        .expect("daemon task panicked");
    result.expect("daemon errored during shutdown");
}

#[tokio::test]
async fn happy_path_job_runs_to_finished() {
    let mut harness = start_daemon();
    let path = write_file(&harness.dir, "cube.g", "G1 X10\nG1 X20\nM400\n");

    select_and_start(&harness, &path).await;
    wait_phase(&mut harness, JobPhase::Finished).await;

    let majors: Vec<i32> = harness.firmware.codes_seen().iter().map(|c| c.major).collect();
    assert_eq!(majors, vec![1, 1, 400]);
    assert_eq!(harness.firmware.acks_sent().len(), 3);

    let status = job_status(&harness.executor).await;
    assert_eq!(status["lastFileAborted"], false);
    assert_eq!(status["lastFileCancelled"], false);

    // PrintStarted then PrintStopped crossed the wire.
    let controls = harness.firmware.controls_seen();
    assert!(controls.contains(&SbcRequest::PrintStarted.wire_id()));
    assert!(controls.contains(&SbcRequest::PrintStopped.wire_id()));

    stop(&mut harness).await;
}

#[tokio::test]
async fn pause_mid_file_commits_firmware_offset() {
    let mut harness = start_daemon();
    // 4-byte lines; offset 412 is a line boundary (line 103).
    let path = write_file(&harness.dir, "long.g", &"M83\n".repeat(200));

    select_and_start(&harness, &path).await;
    wait_codes_seen(&harness.firmware, 5).await;

    harness.firmware.inject(
        FirmwareRequest::PrintPaused,
        PrintPausedPayload {
            file_position: 412,
            reason: PauseReason::User,
        }
        .encode(),
    );
    wait_phase(&mut harness, JobPhase::Paused).await;

    // The committed offset is the firmware-reported one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    match harness.executor.execute(Command::GetFilePosition).await.unwrap() {
        CommandResponse::FilePosition(position) => assert_eq!(position, 412),
        other => panic!("unexpected response {other:?}"),
    }

    // No further codes while paused.
    let seen_while_paused = harness.firmware.codes_seen().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.firmware.codes_seen().len(), seen_while_paused);

    // Resume restarts the stream exactly at the committed offset.
    harness.executor.execute(Command::Resume).await.unwrap();
    wait_codes_seen(&harness.firmware, seen_while_paused + 1).await;
    let first_after_resume = &harness.firmware.codes_seen()[seen_while_paused];
    assert_eq!(first_after_resume.file_position, 412);

    wait_phase(&mut harness, JobPhase::Finished).await;
    stop(&mut harness).await;
}

#[tokio::test]
async fn corrupted_transfer_rolls_back_and_resends_once() {
    let mut harness = start_daemon();

    // Let the startup object-model request clear the wire first, so the
    // armed corruption hits the code cycle and nothing else.
    tokio::time::timeout(Duration::from_secs(10), async {
        while harness.firmware.controls_seen().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("startup traffic never arrived");
    harness.firmware.arm_body_corruption();

    // A single code in the corrupted cycle: delivered exactly once to
    // the firmware, resent exactly once by the SBC.
    let response = harness
        .executor
        .execute(Command::SimpleCode {
            channel: gantry_types::CodeChannel::Http,
            code: "M115".into(),
        })
        .await
        .unwrap();
    match response {
        CommandResponse::CodeResult(result) => assert!(result.is_empty()),
        other => panic!("unexpected response {other:?}"),
    }

    assert_eq!(harness.firmware.duplicate_code_packets(), 1);
    let m115: Vec<_> = harness
        .firmware
        .codes_seen()
        .into_iter()
        .filter(|c| c.major == 115)
        .collect();
    assert_eq!(m115.len(), 1, "code delivered exactly once");

    stop(&mut harness).await;
}

#[tokio::test]
async fn macro_expansion_defers_the_opening_code() {
    let mut harness = start_daemon();
    harness.firmware.set_macro_file("foo.g");
    write_file(&harness.dir, "foo.g", "G91\nG1 Z5\n");
    let path = write_file(&harness.dir, "job.g", "M98 P\"foo.g\"\nM400\n");

    select_and_start(&harness, &path).await;
    wait_phase(&mut harness, JobPhase::Finished).await;

    // The M98 went first, and the macro's codes ran on the File
    // channel in macro order. (M400 was read ahead by the job pipeline
    // and may interleave; the firmware orders execution by its own
    // buffers.)
    let codes = harness.firmware.codes_seen();
    let majors: Vec<i32> = codes.iter().map(|c| c.major).collect();
    assert_eq!(majors[0], 98);
    let index_of = |major: i32| majors.iter().position(|m| *m == major).unwrap();
    assert!(index_of(91) < index_of(1), "macro codes kept their order");

    // The M98 acknowledgement is gated on MacroCompleted, so it comes
    // after the macro codes' acknowledgements.
    let m98_id = codes[0].code_id;
    let id_of = |major: i32| codes[index_of(major)].code_id;
    let acks = harness.firmware.acks_sent();
    let ack_pos = |id: u16| acks.iter().position(|a| *a == id).unwrap();
    assert!(ack_pos(m98_id) > ack_pos(id_of(91)));
    assert!(ack_pos(m98_id) > ack_pos(id_of(1)));

    // Macro codes carry no file position; the job's own codes do.
    assert_eq!(codes[index_of(91)].file_position, u32::MAX);
    assert_eq!(codes[0].file_position, 0);

    stop(&mut harness).await;
}

#[tokio::test]
async fn cancel_during_run_fails_in_flight_codes() {
    let mut harness = start_daemon();
    // The firmware never acks, so codes pile up in flight.
    harness.firmware.set_auto_ack(false);
    let path = write_file(&harness.dir, "job.g", &"G1 X1\n".repeat(100));

    select_and_start(&harness, &path).await;
    wait_codes_seen(&harness.firmware, 4).await;

    harness.executor.execute(Command::Cancel).await.unwrap();
    wait_phase(&mut harness, JobPhase::Finished).await;

    let status = job_status(&harness.executor).await;
    assert_eq!(status["lastFileCancelled"], true);
    assert_eq!(status["lastFileAborted"], false);

    // Nothing new is dispatched after the cancel.
    let seen = harness.firmware.codes_seen().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.firmware.codes_seen().len(), seen);

    stop(&mut harness).await;
}

#[tokio::test]
async fn dead_link_terminates_the_daemon() {
    let harness = start_daemon();
    harness.firmware.kill_link();

    let result = tokio::time::timeout(Duration::from_secs(10), harness.run)
        .await
        .expect("daemon did not notice the dead link")
        .expect("daemon task panicked");
    assert!(matches!(result, Err(DaemonError::LinkFailure(_))));
}

#[tokio::test]
async fn plugin_state_is_written_at_shutdown() {
    let mut harness = start_daemon();
    let state_file = harness.dir.path().join("plugins.txt");

    // Let at least one cycle commit, then shut down.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let dir_keepalive = harness.dir.path().to_path_buf();
    stop(&mut harness).await;

    assert!(state_file.exists(), "state file missing in {dir_keepalive:?}");
}
