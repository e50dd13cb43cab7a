//! Owned frames handed between the acquisition loop and its consumers.
//!
//! - `Frame`: pixels copied out of the driver buffer plus routing/timing metadata.
//! - `PixelFormat`: the subset of sensor formats the pipeline understands.
//! - `FrameStamp`: the per-frame tuple written to timestamp sidecars.
//!
//! Driver buffers are transient. A `Frame` is always built from a copy, so the
//! driver can recycle its buffer as soon as `Frame::copy_from` returns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use crate::camera::GrabResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Rgb8,
    Bgr8,
}

impl PixelFormat {
    pub fn channels(self) -> u32 {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
        }
    }

    /// Node entry name used by GenICam-style devices.
    pub fn node_entry(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Rgb8 => "RGB8",
            PixelFormat::Bgr8 => "BGR8",
        }
    }

    /// ffmpeg `-pix_fmt` name for raw input of this format.
    pub fn ffmpeg_pix_fmt(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "gray",
            PixelFormat::Rgb8 => "rgb24",
            PixelFormat::Bgr8 => "bgr24",
        }
    }

    pub fn is_color(self) -> bool {
        self.channels() > 1
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.node_entry())
    }
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "Mono8" => Ok(PixelFormat::Mono8),
            "RGB8" | "RGB8Packed" => Ok(PixelFormat::Rgb8),
            "BGR8" | "BGR8Packed" => Ok(PixelFormat::Bgr8),
            other => Err(anyhow::anyhow!("unsupported pixel format '{}'", other)),
        }
    }
}

/// One captured image, owned by whichever queue currently holds it.
///
/// Pixels sit behind an `Arc` so the same capture can be routed to the encoder
/// and the preview queue without a second copy.
#[derive(Clone)]
pub struct Frame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Logical camera slot the frame was routed to.
    pub camera: usize,
    /// Per-camera sequence assigned by the acquisition loop, starting at 0.
    pub sequence: u64,
    /// Device-side frame id (counts every frame the camera produced).
    pub camera_frame_id: u64,
    /// Device-side image number within the current grab session.
    pub image_number: u64,
    /// Device timestamp in ticks. Only kept when timestamping is enabled.
    pub device_timestamp: Option<u64>,
    pub arrived_at: SystemTime,
}

impl Frame {
    /// Build a frame from explicit parts. Used by synthetic sources and tests.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        camera: usize,
        sequence: u64,
    ) -> Self {
        Self {
            pixels: pixels.into(),
            width,
            height,
            pixel_format,
            camera,
            sequence,
            camera_frame_id: sequence,
            image_number: sequence + 1,
            device_timestamp: None,
            arrived_at: SystemTime::now(),
        }
    }

    /// Copy a driver grab into an owned frame.
    pub fn copy_from(
        grab: &GrabResult<'_>,
        camera: usize,
        sequence: u64,
        keep_timestamp: bool,
    ) -> Self {
        Self {
            pixels: Arc::from(grab.pixels),
            width: grab.width,
            height: grab.height,
            pixel_format: grab.pixel_format,
            camera,
            sequence,
            camera_frame_id: grab.camera_frame_id,
            image_number: grab.image_number,
            device_timestamp: if keep_timestamp {
                grab.device_timestamp
            } else {
                None
            },
            arrived_at: SystemTime::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn channels(&self) -> u32 {
        self.pixel_format.channels()
    }

    /// Size in bytes a tightly packed image of this geometry occupies.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels() as usize
    }

    pub fn stamp(&self) -> FrameStamp {
        FrameStamp {
            camera_frame_id: self.camera_frame_id,
            frame_number: self.image_number,
            device_timestamp: self.device_timestamp,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("camera", &self.camera)
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// `(camera_frame_id, frame_number, device_timestamp)` as written to the sidecar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStamp {
    pub camera_frame_id: u64,
    pub frame_number: u64,
    pub device_timestamp: Option<u64>,
}

impl Serialize for FrameStampTuple<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            self.0.camera_frame_id,
            self.0.frame_number,
            self.0.device_timestamp,
        )
            .serialize(serializer)
    }
}

pub(crate) struct FrameStampTuple<'a>(pub &'a FrameStamp);

/// Serialize stamps in the sidecar layout: `[[id, number, ts], ...]`.
pub fn stamps_to_json(stamps: &[FrameStamp]) -> serde_json::Result<String> {
    let tuples: Vec<FrameStampTuple<'_>> = stamps.iter().map(FrameStampTuple).collect();
    serde_json::to_string(&tuples)
}

/// Parse a sidecar written by [`stamps_to_json`].
pub fn stamps_from_json(raw: &str) -> serde_json::Result<Vec<FrameStamp>> {
    let tuples: Vec<(u64, u64, Option<u64>)> = serde_json::from_str(raw)?;
    Ok(tuples
        .into_iter()
        .map(|(camera_frame_id, frame_number, device_timestamp)| FrameStamp {
            camera_frame_id,
            frame_number,
            device_timestamp,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_parses_packed_aliases() {
        assert_eq!("BGR8Packed".parse::<PixelFormat>().unwrap(), PixelFormat::Bgr8);
        assert_eq!("Mono8".parse::<PixelFormat>().unwrap(), PixelFormat::Mono8);
        assert!("YUV422".parse::<PixelFormat>().is_err());
        assert_eq!(PixelFormat::Rgb8.ffmpeg_pix_fmt(), "rgb24");
    }

    #[test]
    fn cloned_frames_share_pixels() {
        let frame = Frame::new(vec![1, 2, 3, 4], 2, 2, PixelFormat::Mono8, 0, 9);
        let copy = frame.clone();
        assert_eq!(copy.pixels().as_ptr(), frame.pixels().as_ptr());
        assert_eq!(frame.expected_len(), 4);
        assert_eq!(frame.stamp().frame_number, 10);
    }

    #[test]
    fn sidecar_layout_is_array_of_triples() {
        let stamps = vec![
            FrameStamp {
                camera_frame_id: 0,
                frame_number: 1,
                device_timestamp: Some(100),
            },
            FrameStamp {
                camera_frame_id: 1,
                frame_number: 2,
                device_timestamp: None,
            },
        ];
        let json = stamps_to_json(&stamps).unwrap();
        assert_eq!(json, "[[0,1,100],[1,2,null]]");
        assert_eq!(stamps_from_json(&json).unwrap(), stamps);
    }
}
