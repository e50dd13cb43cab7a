//! Status surface polled by the control layer.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::fault::Fault;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Viewing = 1,
    Recording = 2,
}

impl SessionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Viewing,
            2 => SessionState::Recording,
            _ => SessionState::Idle,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Viewing => f.write_str("viewing"),
            SessionState::Recording => f.write_str("recording"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EncoderStatus {
    pub path: PathBuf,
    pub queue_len: usize,
    pub queue_capacity: usize,
    /// Smoothed frames per second, `None` before the first write.
    pub write_speed: Option<f64>,
    pub frames_written: u64,
    pub summary: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraStatus {
    pub slot: usize,
    pub name: String,
    pub frames: u64,
    pub preview_queue: Option<usize>,
    pub encoder: Option<EncoderStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Sticky error flag.
    pub error: bool,
    pub fault: Option<Fault>,
    pub session_id: Option<String>,
    pub cameras: Vec<CameraStatus>,
}

impl SessionStatus {
    /// One line per camera, for consoles.
    pub fn lines(&self) -> Vec<String> {
        self.cameras
            .iter()
            .map(|cam| match &cam.encoder {
                Some(enc) => format!("{}: {} frames; {}", cam.name, cam.frames, enc.summary),
                None => format!(
                    "{}: {} frames; preview {}",
                    cam.name,
                    cam.frames,
                    cam.preview_queue
                        .map_or_else(|| "off".to_string(), |n| n.to_string())
                ),
            })
            .collect()
    }
}
