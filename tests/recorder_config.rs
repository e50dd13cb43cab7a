use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use multicam_recorder::config::RecorderConfig;
use multicam_recorder::{Codec, TriggerMode};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RECORDER_CONFIG",
        "RECORDER_OUTPUT_DIR",
        "RECORDER_FPS",
        "RECORDER_CODEC",
        "RECORDER_QUALITY",
        "RECORDER_HW_TRIGGER",
        "RECORDER_WRITE_TIMESTAMPS",
        "RECORDER_GRAB_TIMEOUT_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "output_dir": "/data/behavior",
        "frame_rate": 30,
        "camera_registry": "/data/cameras.json",
        "acquisition": {
            "hardware_trigger": false,
            "trigger_line": "Line1",
            "grab_timeout_ms": 2000,
            "grab_poll_ms": 50
        },
        "encoder": {
            "codec": "mpeg4",
            "quality": 5,
            "video_extension": ".avi",
            "queue_capacity": 256
        },
        "preview": { "enabled": false },
        "synthetic": { "cameras": 4, "trigger_rate": 60.0 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("RECORDER_CONFIG", file.path());
    std::env::set_var("RECORDER_FPS", "45");
    std::env::set_var("RECORDER_HW_TRIGGER", "yes");
    std::env::set_var("RECORDER_WRITE_TIMESTAMPS", "1");

    let cfg = RecorderConfig::load().expect("load config");

    assert_eq!(cfg.output_dir.to_str(), Some("/data/behavior"));
    assert_eq!(cfg.frame_rate, 45);
    assert_eq!(
        cfg.camera_registry.as_deref().and_then(|p| p.to_str()),
        Some("/data/cameras.json")
    );
    assert_eq!(cfg.trigger_mode(), TriggerMode::Hardware);
    assert_eq!(cfg.acquisition.trigger_line, "Line1");
    assert_eq!(cfg.acquisition.grab_timeout, Duration::from_millis(2000));
    assert_eq!(cfg.acquisition.grab_poll, Duration::from_millis(50));
    assert_eq!(cfg.encoder.codec, Codec::Mpeg4);
    assert_eq!(cfg.encoder.quality, 5);
    assert_eq!(cfg.encoder.video_extension, "avi");
    assert!(cfg.encoder.write_timestamps);
    assert_eq!(cfg.encoder.queue_capacity, 256);
    assert!(!cfg.preview.enabled);
    assert_eq!(cfg.synthetic.cameras, 4);
    assert_eq!(cfg.synthetic.trigger_rate, Some(60.0));

    let settings = cfg.acquisition_settings();
    assert_eq!(settings.trigger, TriggerMode::Hardware);
    assert_eq!(settings.frame_rate, 45.0);
    assert_eq!(settings.hardware_trigger_frame_rate, 200.0);

    clear_env();
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RecorderConfig::load().expect("load defaults");
    assert_eq!(cfg.output_dir.to_str(), Some("behav_vid"));
    assert_eq!(cfg.frame_rate, 10);
    assert_eq!(cfg.encoder.codec, Codec::Libx264);
    assert_eq!(cfg.trigger_mode(), TriggerMode::FreeRun);
    assert!(cfg.preview.enabled);

    clear_env();
}

#[test]
fn rejects_invalid_environment_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RECORDER_CODEC", "h265_magic");
    assert!(RecorderConfig::load().is_err());
    clear_env();

    std::env::set_var("RECORDER_FPS", "1000");
    let err = RecorderConfig::load().unwrap_err();
    assert!(err.to_string().contains("frame_rate"), "{err}");
    clear_env();

    std::env::set_var("RECORDER_GRAB_TIMEOUT_MS", "50");
    let err = RecorderConfig::load().unwrap_err();
    assert!(err.to_string().contains("poll"), "{err}");
    clear_env();
}

#[test]
fn rejects_unknown_keys() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "encoder": { "bitrate": 5 } }"#)
        .expect("write config");
    std::env::set_var("RECORDER_CONFIG", file.path());
    assert!(RecorderConfig::load().is_err());

    clear_env();
}
