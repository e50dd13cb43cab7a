//! Camera source abstraction.
//!
//! Vendor SDKs plug in through three traits:
//! - `CameraDriver`: transport layer. Enumerates devices and attaches them as an array.
//! - `CameraArray`: owns the attached devices and multiplexes grabs across all of them.
//! - `CameraDevice`: one physical camera. GenICam-style node access, open/close and a
//!   blocking single-camera retrieve.
//!
//! On top of those, `CameraHandle` holds what the pipeline knows about a camera
//! (identity, logical context, negotiated capabilities, current configuration), and
//! `CameraRig` bundles the array with its handles so the whole set is locked by the
//! acquisition thread for the duration of a run.
//!
//! A bundled `synthetic` driver stands in for hardware in tests and demos.

pub mod capabilities;
pub mod handle;
pub mod registry;
pub mod rig;
pub mod synthetic;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::frame::PixelFormat;

pub use capabilities::{CameraCapabilities, ConfigurationError, Property};
pub use handle::{AcquisitionSettings, CameraHandle, CameraLimits, CameraSettings};
pub use registry::{CameraRegistry, RegistryEntry};
pub use rig::CameraRig;
pub use synthetic::{SyntheticCameraSpec, SyntheticDriver, SyntheticFault};

/// Identity of a discovered device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: String,
    pub vendor: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Enum(String),
}

impl NodeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NodeValue::Float(v) => Some(*v),
            NodeValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NodeValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&str> {
        match self {
            NodeValue::Enum(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::Float(v) => write!(f, "{v}"),
            NodeValue::Int(v) => write!(f, "{v}"),
            NodeValue::Bool(v) => write!(f, "{v}"),
            NodeValue::Enum(v) => f.write_str(v),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Float,
    Int,
    Bool,
    Enum,
}

/// Static description of a device node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Symbolic entries for enum nodes.
    pub entries: Vec<String>,
    pub writable: bool,
}

/// Errors reported by a device when a node is read or written.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeError {
    NotAvailable(String),
    OutOfRange { node: String, value: String },
    AccessDenied(String),
    WrongType(String),
    Device(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::NotAvailable(node) => write!(f, "node {node} is not available"),
            NodeError::OutOfRange { node, value } => {
                write!(f, "value {value} is out of range for node {node}")
            }
            NodeError::AccessDenied(node) => write!(f, "node {node} is not writable right now"),
            NodeError::WrongType(node) => write!(f, "wrong value type for node {node}"),
            NodeError::Device(msg) => write!(f, "device error: {msg}"),
        }
    }
}

impl std::error::Error for NodeError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Camera runs on its own clock at the configured frame rate.
    FreeRun,
    /// One frame per rising edge on the configured input line.
    Hardware,
}

/// How the driver treats filled buffers the consumer has not fetched yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrabStrategy {
    /// Keep up to `OutputQueueSize` buffers; older ones are reported as skipped.
    LatestImages,
    /// Keep only the newest buffer.
    LatestImageOnly,
}

/// A successful grab. `pixels` borrows the driver buffer and must be copied out
/// before the next call into the driver.
#[derive(Debug)]
pub struct GrabResult<'a> {
    pub context: u32,
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub camera_frame_id: u64,
    pub image_number: u64,
    pub device_timestamp: Option<u64>,
    /// Frames the driver dropped since the previous retrieve for this camera.
    pub skipped: u32,
}

#[derive(Debug)]
pub enum GrabOutcome<'a> {
    Frame(GrabResult<'a>),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The driver delivered a buffer that failed to grab (e.g. incomplete transfer).
    Incomplete { context: u32, reason: String },
    /// Hard device error. Grabbing cannot continue.
    Failed(String),
}

/// One physical camera as exposed by a driver.
pub trait CameraDevice: Send {
    fn info(&self) -> &DeviceInfo;

    fn is_open(&self) -> bool;

    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Describe node `name`, or `None` if this model does not have it.
    fn node(&self, name: &str) -> Option<NodeInfo>;

    fn read(&self, name: &str) -> Result<NodeValue, NodeError>;

    fn write(&mut self, name: &str, value: NodeValue) -> Result<(), NodeError>;

    fn context(&self) -> u32;

    fn set_context(&mut self, context: u32);

    fn start_grabbing(&mut self, strategy: GrabStrategy) -> Result<()>;

    /// Blocking single-camera fetch, bounded by `timeout`.
    fn retrieve(&mut self, timeout: Duration) -> GrabOutcome<'_>;

    fn stop_grabbing(&mut self);
}

/// A set of attached cameras that can be grabbed as one stream.
pub trait CameraArray: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn device(&self, slot: usize) -> Option<&dyn CameraDevice>;

    fn device_mut(&mut self, slot: usize) -> Option<&mut dyn CameraDevice>;

    fn start_grabbing(&mut self, strategy: GrabStrategy) -> Result<()>;

    /// Block until any grabbing camera delivers a frame, or `timeout` passes.
    fn retrieve(&mut self, timeout: Duration) -> GrabOutcome<'_>;

    fn stop_grabbing(&mut self);
}

/// Transport layer: discovery and attachment.
pub trait CameraDriver: Send {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>>;

    fn attach(&mut self, devices: &[DeviceInfo]) -> Result<Box<dyn CameraArray>>;
}
