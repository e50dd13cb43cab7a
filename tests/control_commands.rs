use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use multicam_recorder::control::handle_line;
use multicam_recorder::{
    Codec, ProcessBackend, RecorderConfig, SessionCoordinator, SessionState, SyntheticDriver,
};

fn coordinator(dir: &std::path::Path) -> SessionCoordinator {
    let mut config = RecorderConfig {
        output_dir: dir.to_path_buf(),
        frame_rate: 50,
        ..RecorderConfig::default()
    };
    config.acquisition.grab_poll = Duration::from_millis(20);
    config.encoder.codec = Codec::Raw;
    config.encoder.video_extension = "raw".into();
    config.encoder.write_timestamps = true;
    let coord = SessionCoordinator::new(
        config,
        Box::new(SyntheticDriver::uniform(2, 8, 4, false)),
        Arc::new(ProcessBackend::default()),
    );
    coord.connect().unwrap();
    coord
}

fn send(coord: &SessionCoordinator, line: &str) -> Value {
    let reply = handle_line(coord, line);
    serde_json::from_str(&reply).unwrap()
}

#[test]
fn viewing_then_stop() {
    let dir = tempfile::tempdir().unwrap();
    let coord = coordinator(dir.path());

    let reply = send(&coord, r#"{"type":"start_viewing"}"#);
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["status"], "viewing_ok");
    assert_eq!(coord.state(), SessionState::Viewing);

    let reply = send(&coord, r#"{"type":"poll_status"}"#);
    assert_eq!(reply["status"], "status");
    assert_eq!(reply["session"]["state"], "viewing");
    assert_eq!(reply["session"]["error"], false);
    assert_eq!(reply["session"]["cameras"].as_array().map(Vec::len), Some(2));

    let reply = send(&coord, r#"{"type":"start_viewing","camera":1}"#);
    assert_eq!(reply["status"], "error");
    assert!(reply["message"].as_str().unwrap().contains("already viewing"));

    let reply = send(&coord, r#"{"type":"stop"}"#);
    assert_eq!(reply["status"], "stop_ok");
    assert_eq!(reply["stopped"]["stopped"], "viewing");
    assert_eq!(coord.state(), SessionState::Idle);
}

#[test]
fn recording_with_settings_file_and_fps() {
    let dir = tempfile::tempdir().unwrap();
    let coord = coordinator(dir.path());
    let settings = dir.path().join("rig.settings.json");
    std::fs::write(
        &settings,
        r#"{ "fps": 40, "cam01": { "gain": 3.0, "exp_time": 2000.0 } }"#,
    )
    .unwrap();

    let line = format!(
        r#"{{"type":"start_rec","session_id":"rat_12","fps":25,"setting_file":"{}"}}"#,
        settings.display()
    );
    let reply = send(&coord, &line);
    assert_eq!(reply["status"], "recording_ok", "{reply}");
    assert_eq!(reply["recording"]["session_id"], "rat_12");
    assert_eq!(reply["recording"]["files"].as_array().map(Vec::len), Some(2));
    std::thread::sleep(Duration::from_millis(200));

    let reply = send(&coord, r#"{"type":"poll_status"}"#);
    assert_eq!(reply["session"]["state"], "recording");
    assert_eq!(reply["session"]["session_id"], "rat_12");
    let summary = reply["session"]["cameras"][0]["encoder"]["summary"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(summary.starts_with("Queue "), "{summary}");

    let reply = send(&coord, r#"{"type":"stop"}"#);
    assert_eq!(reply["status"], "stop_ok");
    let settings = coord.camera_settings(1).unwrap();
    assert_eq!(settings.gain, Some(3.0));
    assert_eq!(settings.exp_time, Some(2000.0));
}

#[test]
fn bad_input_is_answered_with_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let coord = coordinator(dir.path());

    let reply = send(&coord, "not json");
    assert_eq!(reply["status"], "error");

    let reply = send(&coord, r#"{"type":"start_rec","session_id":"../escape"}"#);
    assert_eq!(reply["status"], "error");
    assert_eq!(coord.state(), SessionState::Idle);

    let reply = send(&coord, r#"{"type":"stop"}"#);
    assert_eq!(reply["status"], "stop_ok");
}
