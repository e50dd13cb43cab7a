//! JSON control commands.
//!
//! One command per message, mapped 1:1 onto a `SessionCoordinator` call. The
//! transport (stdin lines in the `recorder serve` binary) lives elsewhere.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::session::{RecordOptions, RecordingInfo, SessionCoordinator, StopReport};
use crate::status::SessionStatus;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    StartViewing {
        /// Preview a single camera instead of the whole rig.
        #[serde(default)]
        camera: Option<usize>,
    },
    StartRec {
        session_id: String,
        #[serde(default, alias = "frame_rate")]
        fps: Option<u32>,
        #[serde(default)]
        setting_file: Option<PathBuf>,
    },
    Stop,
    PollStatus,
}

impl Command {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Response,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    RecordingOk,
    ViewingOk,
    StopOk,
    Status,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionStatus>,
}

impl Response {
    fn new(status: ResponseStatus) -> Self {
        Self {
            kind: MessageType::Response,
            status,
            message: None,
            recording: None,
            stopped: None,
            session: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(ResponseStatus::Error)
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| encoding_failure(&err.to_string()))
    }
}

fn encoding_failure(message: &str) -> String {
    serde_json::json!({
        "type": "response",
        "status": "error",
        "message": message,
    })
    .to_string()
}

pub fn dispatch(coordinator: &SessionCoordinator, command: Command) -> Response {
    log::debug!("Control: {:?}", command);
    match command {
        Command::StartViewing { camera } => {
            let started = match camera {
                Some(slot) => coordinator.start_single_view(slot),
                None => coordinator.start_viewing(),
            };
            match started {
                Ok(()) => Response::new(ResponseStatus::ViewingOk),
                Err(err) => rejected("start_viewing", err),
            }
        }
        Command::StartRec {
            session_id,
            fps,
            setting_file,
        } => {
            let options = RecordOptions {
                fps,
                settings_file: setting_file.filter(|p| !p.as_os_str().is_empty()),
            };
            match coordinator.start_recording_with(&session_id, &options) {
                Ok(info) => Response {
                    recording: Some(info),
                    ..Response::new(ResponseStatus::RecordingOk)
                },
                Err(err) => rejected("start_rec", err),
            }
        }
        Command::Stop => match coordinator.stop() {
            Ok(report) => Response {
                stopped: Some(report),
                ..Response::new(ResponseStatus::StopOk)
            },
            Err(err) => rejected("stop", err),
        },
        Command::PollStatus => Response {
            session: Some(coordinator.poll_status()),
            ..Response::new(ResponseStatus::Status)
        },
    }
}

/// Parse one line, run it, and render the reply.
pub fn handle_line(coordinator: &SessionCoordinator, line: &str) -> String {
    let response = match Command::parse(line) {
        Ok(command) => dispatch(coordinator, command),
        Err(err) => {
            log::warn!("Control: unreadable command: {}", err);
            Response::error(format!("invalid command: {err}"))
        }
    };
    response.to_json()
}

fn rejected(command: &str, err: anyhow::Error) -> Response {
    log::warn!("Control: {} rejected: {:#}", command, err);
    Response::error(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            Command::parse(r#"{"type":"start_viewing"}"#).unwrap(),
            Command::StartViewing { camera: None }
        );
        assert_eq!(
            Command::parse(r#"{"type":"start_rec","session_id":"m1","frame_rate":30}"#).unwrap(),
            Command::StartRec {
                session_id: "m1".into(),
                fps: Some(30),
                setting_file: None,
            }
        );
        assert_eq!(Command::parse(" {\"type\":\"stop\"}\n").unwrap(), Command::Stop);
        assert!(Command::parse(r#"{"type":"purge_files"}"#).is_err());
        assert!(Command::parse(r#"{"type":"start_rec"}"#).is_err());
    }

    #[test]
    fn responses_carry_type_and_status() {
        let value: serde_json::Value =
            serde_json::from_str(&Response::new(ResponseStatus::StopOk).to_json()).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["status"], "stop_ok");
        assert!(value.get("message").is_none());

        let value: serde_json::Value =
            serde_json::from_str(&Response::error("nope").to_json()).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "nope");
    }

    #[test]
    fn encoding_failures_are_still_valid_json() {
        let reason = r#"key must be a string: "a\b" at line 1"#;
        let value: serde_json::Value = serde_json::from_str(&encoding_failure(reason)).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], reason);
    }
}
