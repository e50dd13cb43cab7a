//! Multi-camera recorder.
//!
//! Synchronous acquisition from a set of cameras with asynchronous per-camera
//! video encoding.
//!
//! # Architecture
//!
//! One acquisition thread multiplexes grabs across the whole camera array and fans
//! each frame out to its camera's encoder queue and preview queue. Every encoder
//! runs its own worker thread. Queues are bounded and a full queue is a fatal
//! fault for the session, never a silent wait. Faults raised on worker threads
//! are recorded in a sticky flag that the coordinator and the external poll
//! layer check.
//!
//! # Module Structure
//!
//! - `queue`: bounded FIFO with non-blocking overflow reporting
//! - `frame`: owned frames and the timestamp sidecar format
//! - `camera`: driver/array/device traits, capabilities, registry, synthetic driver
//! - `encoder`: async per-camera encoder and its ffmpeg/raw backends
//! - `acquisition`: the multiplexed acquisition loop
//! - `fault`: sticky fault flag and cancellation signal
//! - `session`: the coordinator that owns all of the above
//! - `status`, `control`: what the external control layer sees and sends
//! - `config`: layered configuration and per-camera settings files

pub mod acquisition;
pub mod camera;
pub mod config;
pub mod control;
pub mod encoder;
pub mod fault;
pub mod frame;
pub mod queue;
pub mod session;
pub mod status;
pub mod ui;

pub use acquisition::{AcquisitionLoop, AcquisitionPhase, AcquisitionPlan, Route};
pub use camera::{
    CameraArray, CameraDevice, CameraDriver, CameraHandle, CameraRig, DeviceInfo, GrabOutcome,
    GrabStrategy, SyntheticCameraSpec, SyntheticDriver, SyntheticFault, TriggerMode,
};
pub use config::{RecorderConfig, SettingsFile};
pub use control::{Command, Response, ResponseStatus};
pub use encoder::{
    AsyncVideoEncoder, Codec, DrainOutcome, DrainPolicy, EncoderBackend, EncoderSettings,
    FeedError, FrameSink, ProcessBackend,
};
pub use fault::{Fault, FaultKind, QueueRole, SessionSignals};
pub use frame::{Frame, FrameStamp, PixelFormat};
pub use queue::{BoundedQueue, QueueFull};
pub use session::{RecordOptions, RecordingInfo, SessionCoordinator, SessionError, StopReport};
pub use status::{SessionState, SessionStatus};
