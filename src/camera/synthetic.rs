//! Synthetic camera driver.
//!
//! Produces deterministic frames at the configured frame rate without hardware.
//! Each camera exposes a GenICam-style node map shaped like a real model
//! (`Usb3` uses current node names, `Gige` the legacy `...Abs`/`...Raw` aliases and
//! lacks `ReverseY`), so capability negotiation and configuration run the same code
//! paths they would against a vendor SDK.
//!
//! Fault injection hooks let tests stall a camera after N frames, fail the device
//! at frame N, deliver an incomplete grab, or report skipped frames.
//!
//! The first eight bytes of every synthetic image carry the camera frame id
//! (little endian), which makes frame order checkable after encoding.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{
    CameraArray, CameraDevice, CameraDriver, DeviceInfo, GrabOutcome, GrabResult, GrabStrategy,
    NodeError, NodeInfo, NodeKind, NodeValue,
};
use crate::frame::PixelFormat;

const VENDOR: &str = "Synthetic";
const BALANCE_CHANNELS: [&str; 3] = ["Red", "Green", "Blue"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticGeneration {
    Usb3,
    Gige,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticFault {
    /// Hard device failure when frame `n` (0-based) is due.
    DeviceFailureAt(u64),
    /// Frame `n` arrives as an incomplete buffer.
    IncompleteAt(u64),
}

#[derive(Clone, Debug)]
pub struct SyntheticCameraSpec {
    pub serial: String,
    pub model: String,
    pub generation: SyntheticGeneration,
    pub color: bool,
    pub width: u32,
    pub height: u32,
    /// Camera goes silent after producing this many frames.
    pub frame_limit: Option<u64>,
    pub fault: Option<SyntheticFault>,
    /// Report one skipped frame on every n-th delivery.
    pub skip_every: Option<u64>,
}

impl SyntheticCameraSpec {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            model: "synthetic-usb3".to_string(),
            generation: SyntheticGeneration::Usb3,
            color: false,
            width: 64,
            height: 48,
            frame_limit: None,
            fault: None,
            skip_every: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct GrabClock {
    strategy: GrabStrategy,
    started: Instant,
    next_due: Instant,
    /// Frames exposed so far, including skipped ones.
    produced: u64,
    delivered: u64,
}

pub struct SyntheticCamera {
    spec: SyntheticCameraSpec,
    info: DeviceInfo,
    open: bool,
    context: u32,
    nodes: BTreeMap<&'static str, (NodeInfo, NodeValue)>,
    balance: [f64; 3],
    trigger_rate: Option<f64>,
    clock: Option<GrabClock>,
    failed: bool,
    buffer: Vec<u8>,
}

impl SyntheticCamera {
    pub fn new(spec: SyntheticCameraSpec) -> Self {
        let info = DeviceInfo {
            serial: spec.serial.clone(),
            model: spec.model.clone(),
            vendor: VENDOR.to_string(),
        };
        let nodes = build_nodes(&spec);
        Self {
            spec,
            info,
            open: false,
            context: 0,
            nodes,
            balance: [1.0, 1.0, 1.0],
            trigger_rate: None,
            clock: None,
            failed: false,
            buffer: Vec::new(),
        }
    }

    fn set_trigger_rate(&mut self, rate: Option<f64>) {
        self.trigger_rate = rate;
    }

    fn enum_value(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).and_then(|(_, v)| v.as_enum())
    }

    fn float_value(&self, name: &str) -> Option<f64> {
        self.nodes.get(name).and_then(|(_, v)| v.as_f64())
    }

    fn frame_rate_node(&self) -> &'static str {
        match self.spec.generation {
            SyntheticGeneration::Usb3 => "AcquisitionFrameRate",
            SyntheticGeneration::Gige => "AcquisitionFrameRateAbs",
        }
    }

    /// Time between frames, or `None` when no frames will arrive.
    fn period(&self) -> Option<Duration> {
        let rate = if self.enum_value("TriggerMode") == Some("On") {
            self.trigger_rate?
        } else {
            let node = self.frame_rate_node();
            let enabled = self
                .nodes
                .get("AcquisitionFrameRateEnable")
                .and_then(|(_, v)| v.as_bool())
                .unwrap_or(true);
            if enabled {
                self.float_value(node)?
            } else {
                self.nodes.get(node)?.0.max?
            }
        };
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(1.0 / rate))
    }

    fn next_due(&self) -> Option<Instant> {
        let clock = self.clock.as_ref()?;
        if self.failed {
            return None;
        }
        if let Some(limit) = self.spec.frame_limit {
            if clock.produced >= limit {
                return None;
            }
        }
        self.period()?;
        Some(clock.next_due)
    }

    fn pixel_format(&self) -> PixelFormat {
        self.enum_value("PixelFormat")
            .and_then(|v| v.parse().ok())
            .unwrap_or(PixelFormat::Mono8)
    }

    fn output_queue_size(&self) -> u64 {
        self.float_value("OutputQueueSize")
            .map(|v| v.max(1.0) as u64)
            .unwrap_or(8)
    }

    /// Deliver the frame that is due now. Callers check `next_due` first.
    fn produce(&mut self, now: Instant) -> GrabOutcome<'_> {
        let Some(period) = self.period() else {
            return GrabOutcome::Timeout;
        };
        let queue_size = self.output_queue_size();
        let Some(clock) = self.clock.as_mut() else {
            return GrabOutcome::Failed(format!("{} is not grabbing", self.info.serial));
        };

        let behind = if now > clock.next_due {
            ((now - clock.next_due).as_nanos() / period.as_nanos().max(1)) as u64
        } else {
            0
        };
        let mut skipped = match clock.strategy {
            GrabStrategy::LatestImageOnly => behind,
            GrabStrategy::LatestImages => behind.saturating_sub(queue_size),
        };
        if let Some(limit) = self.spec.frame_limit {
            skipped = skipped.min(limit.saturating_sub(clock.produced + 1));
        }
        clock.produced += skipped;
        clock.next_due += period * skipped as u32;

        let index = clock.produced;
        let due = clock.next_due;
        clock.produced += 1;
        clock.next_due += period;

        match self.spec.fault {
            Some(SyntheticFault::DeviceFailureAt(n)) if index >= n => {
                self.failed = true;
                return GrabOutcome::Failed(format!(
                    "synthetic device failure on {} at frame {}",
                    self.info.serial, index
                ));
            }
            Some(SyntheticFault::IncompleteAt(n)) if index == n => {
                return GrabOutcome::Incomplete {
                    context: self.context,
                    reason: "buffer incompletely grabbed".to_string(),
                };
            }
            _ => {}
        }

        clock.delivered += 1;
        if let Some(every) = self.spec.skip_every {
            if every > 0 && clock.delivered % every == 0 {
                skipped += 1;
            }
        }
        let image_number = clock.delivered;
        let timestamp = (due - clock.started).as_nanos() as u64;

        let format = self.pixel_format();
        let len = self.spec.width as usize * self.spec.height as usize * format.channels() as usize;
        self.buffer.resize(len, 0);
        for (i, px) in self.buffer.iter_mut().enumerate() {
            *px = ((i as u64 + index) % 256) as u8;
        }
        let marker = index.to_le_bytes();
        let n = marker.len().min(self.buffer.len());
        self.buffer[..n].copy_from_slice(&marker[..n]);

        GrabOutcome::Frame(GrabResult {
            context: self.context,
            pixels: &self.buffer,
            width: self.spec.width,
            height: self.spec.height,
            pixel_format: format,
            camera_frame_id: index,
            image_number,
            device_timestamp: Some(timestamp),
            skipped: skipped.min(u32::MAX as u64) as u32,
        })
    }

    fn begin(&mut self, strategy: GrabStrategy, started: Instant) -> Result<()> {
        if !self.open {
            return Err(anyhow!("camera {} is not open", self.info.serial));
        }
        let first = self.period().unwrap_or_default();
        self.failed = false;
        self.clock = Some(GrabClock {
            strategy,
            started,
            next_due: started + first,
            produced: 0,
            delivered: 0,
        });
        Ok(())
    }
}

impl CameraDevice for SyntheticCamera {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.clock = None;
        self.open = false;
        Ok(())
    }

    fn node(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.get(name).map(|(info, _)| info.clone())
    }

    fn read(&self, name: &str) -> Result<NodeValue, NodeError> {
        if !self.open {
            return Err(NodeError::Device(format!("{} is closed", self.info.serial)));
        }
        if matches!(name, "BalanceRatio" | "BalanceRatioAbs") && self.spec.color {
            let idx = self.balance_index();
            return Ok(NodeValue::Float(self.balance[idx]));
        }
        self.nodes
            .get(name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| NodeError::NotAvailable(name.to_string()))
    }

    fn write(&mut self, name: &str, value: NodeValue) -> Result<(), NodeError> {
        if !self.open {
            return Err(NodeError::Device(format!("{} is closed", self.info.serial)));
        }
        let grabbing = self.clock.is_some();
        let balance_idx = self.balance_index();
        let (info, current) = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| NodeError::NotAvailable(name.to_string()))?;
        if !info.writable || (grabbing && matches!(name, "PixelFormat" | "TriggerMode")) {
            return Err(NodeError::AccessDenied(name.to_string()));
        }
        let checked = match (info.kind, &value) {
            (NodeKind::Float, v) | (NodeKind::Int, v) => {
                let x = v
                    .as_f64()
                    .ok_or_else(|| NodeError::WrongType(name.to_string()))?;
                if info.min.is_some_and(|min| x < min) || info.max.is_some_and(|max| x > max) {
                    return Err(NodeError::OutOfRange {
                        node: name.to_string(),
                        value: value.to_string(),
                    });
                }
                if info.kind == NodeKind::Int {
                    NodeValue::Int(x.round() as i64)
                } else {
                    NodeValue::Float(x)
                }
            }
            (NodeKind::Bool, NodeValue::Bool(b)) => NodeValue::Bool(*b),
            (NodeKind::Enum, NodeValue::Enum(entry)) if info.entries.contains(entry) => {
                NodeValue::Enum(entry.clone())
            }
            (NodeKind::Enum, NodeValue::Enum(_)) => {
                return Err(NodeError::OutOfRange {
                    node: name.to_string(),
                    value: value.to_string(),
                })
            }
            _ => return Err(NodeError::WrongType(name.to_string())),
        };
        if matches!(name, "BalanceRatio" | "BalanceRatioAbs") {
            if let Some(x) = checked.as_f64() {
                self.balance[balance_idx] = x;
            }
            return Ok(());
        }
        *current = checked;
        Ok(())
    }

    fn context(&self) -> u32 {
        self.context
    }

    fn set_context(&mut self, context: u32) {
        self.context = context;
    }

    fn start_grabbing(&mut self, strategy: GrabStrategy) -> Result<()> {
        self.begin(strategy, Instant::now())
    }

    fn retrieve(&mut self, timeout: Duration) -> GrabOutcome<'_> {
        let now = Instant::now();
        match self.next_due() {
            Some(due) if due <= now + timeout => {
                sleep_until(due);
                self.produce(Instant::now())
            }
            _ => {
                std::thread::sleep(timeout);
                GrabOutcome::Timeout
            }
        }
    }

    fn stop_grabbing(&mut self) {
        self.clock = None;
    }
}

impl SyntheticCamera {
    fn balance_index(&self) -> usize {
        self.enum_value("BalanceRatioSelector")
            .and_then(|sel| BALANCE_CHANNELS.iter().position(|c| *c == sel))
            .unwrap_or(0)
    }
}

/// Array of synthetic cameras sharing one grab clock.
pub struct SyntheticArray {
    cameras: Vec<SyntheticCamera>,
    trigger_rate: Option<f64>,
}

impl SyntheticArray {
    pub fn new(cameras: Vec<SyntheticCamera>, trigger_rate: Option<f64>) -> Self {
        Self {
            cameras,
            trigger_rate,
        }
    }
}

impl CameraArray for SyntheticArray {
    fn len(&self) -> usize {
        self.cameras.len()
    }

    fn device(&self, slot: usize) -> Option<&dyn CameraDevice> {
        self.cameras.get(slot).map(|c| c as &dyn CameraDevice)
    }

    fn device_mut(&mut self, slot: usize) -> Option<&mut dyn CameraDevice> {
        self.cameras
            .get_mut(slot)
            .map(|c| c as &mut dyn CameraDevice)
    }

    fn start_grabbing(&mut self, strategy: GrabStrategy) -> Result<()> {
        // One start instant for all cameras, like a shared trigger line.
        let started = Instant::now();
        for camera in &mut self.cameras {
            camera.set_trigger_rate(self.trigger_rate);
            camera.begin(strategy, started)?;
        }
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> GrabOutcome<'_> {
        let deadline = Instant::now() + timeout;
        let next = self
            .cameras
            .iter()
            .enumerate()
            .filter_map(|(slot, cam)| cam.next_due().map(|due| (slot, due)))
            .min_by_key(|(_, due)| *due);
        match next {
            Some((slot, due)) if due <= deadline => {
                sleep_until(due);
                self.cameras[slot].produce(Instant::now())
            }
            _ => {
                sleep_until(deadline);
                GrabOutcome::Timeout
            }
        }
    }

    fn stop_grabbing(&mut self) {
        for camera in &mut self.cameras {
            camera.stop_grabbing();
        }
    }
}

/// Driver that "discovers" the configured synthetic cameras.
#[derive(Clone, Debug, Default)]
pub struct SyntheticDriver {
    specs: Vec<SyntheticCameraSpec>,
    trigger_rate: Option<f64>,
}

impl SyntheticDriver {
    pub fn new(specs: Vec<SyntheticCameraSpec>) -> Self {
        Self {
            specs,
            trigger_rate: None,
        }
    }

    /// `count` identical cameras with serials `0815-0000`, `0815-0001`, ...
    pub fn uniform(count: usize, width: u32, height: u32, color: bool) -> Self {
        let specs = (0..count)
            .map(|i| SyntheticCameraSpec {
                width,
                height,
                color,
                ..SyntheticCameraSpec::new(&format!("0815-{:04}", i))
            })
            .collect();
        Self::new(specs)
    }

    /// Rate of the simulated external trigger pulse generator.
    pub fn with_trigger_rate(mut self, rate: Option<f64>) -> Self {
        self.trigger_rate = rate;
        self
    }
}

impl CameraDriver for SyntheticDriver {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .specs
            .iter()
            .map(|spec| DeviceInfo {
                serial: spec.serial.clone(),
                model: spec.model.clone(),
                vendor: VENDOR.to_string(),
            })
            .collect())
    }

    fn attach(&mut self, devices: &[DeviceInfo]) -> Result<Box<dyn CameraArray>> {
        let mut cameras = Vec::with_capacity(devices.len());
        for device in devices {
            let spec = self
                .specs
                .iter()
                .find(|s| s.serial == device.serial)
                .ok_or_else(|| anyhow!("no synthetic camera with serial {}", device.serial))?;
            cameras.push(SyntheticCamera::new(spec.clone()));
        }
        log::info!("SyntheticDriver: attached {} cameras", cameras.len());
        Ok(Box::new(SyntheticArray::new(cameras, self.trigger_rate)))
    }
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}

fn float_node(min: f64, max: f64) -> NodeInfo {
    NodeInfo {
        kind: NodeKind::Float,
        min: Some(min),
        max: Some(max),
        entries: Vec::new(),
        writable: true,
    }
}

fn int_node(min: f64, max: f64) -> NodeInfo {
    NodeInfo {
        kind: NodeKind::Int,
        ..float_node(min, max)
    }
}

fn bool_node() -> NodeInfo {
    NodeInfo {
        kind: NodeKind::Bool,
        min: None,
        max: None,
        entries: Vec::new(),
        writable: true,
    }
}

fn enum_node(entries: &[&str]) -> NodeInfo {
    NodeInfo {
        kind: NodeKind::Enum,
        min: None,
        max: None,
        entries: entries.iter().map(|e| e.to_string()).collect(),
        writable: true,
    }
}

fn build_nodes(spec: &SyntheticCameraSpec) -> BTreeMap<&'static str, (NodeInfo, NodeValue)> {
    let mut nodes = BTreeMap::new();
    let (rate, gain, exposure) = match spec.generation {
        SyntheticGeneration::Usb3 => ("AcquisitionFrameRate", "Gain", "ExposureTime"),
        SyntheticGeneration::Gige => ("AcquisitionFrameRateAbs", "GainRaw", "ExposureTimeAbs"),
    };
    nodes.insert(rate, (float_node(1.0, 250.0), NodeValue::Float(30.0)));
    nodes.insert("AcquisitionFrameRateEnable", (bool_node(), NodeValue::Bool(true)));
    match spec.generation {
        SyntheticGeneration::Usb3 => {
            nodes.insert(gain, (float_node(0.0, 24.0), NodeValue::Float(0.0)));
        }
        SyntheticGeneration::Gige => {
            nodes.insert(gain, (int_node(0.0, 500.0), NodeValue::Int(0)));
        }
    }
    nodes.insert(
        exposure,
        (float_node(20.0, 1_000_000.0), NodeValue::Float(5000.0)),
    );

    let (formats, default_format): (&[&str], &str) = if spec.color {
        (&["Mono8", "RGB8", "BGR8"], "BGR8")
    } else {
        (&["Mono8"], "Mono8")
    };
    nodes.insert(
        "PixelFormat",
        (enum_node(formats), NodeValue::Enum(default_format.into())),
    );
    nodes.insert(
        "AcquisitionMode",
        (
            enum_node(&["Continuous", "SingleFrame"]),
            NodeValue::Enum("Continuous".into()),
        ),
    );
    nodes.insert(
        "TriggerMode",
        (enum_node(&["Off", "On"]), NodeValue::Enum("Off".into())),
    );
    nodes.insert(
        "TriggerSelector",
        (
            enum_node(&["FrameStart", "FrameBurstStart"]),
            NodeValue::Enum("FrameStart".into()),
        ),
    );
    nodes.insert(
        "TriggerSource",
        (
            enum_node(&["Software", "Line1", "Line3", "Line4"]),
            NodeValue::Enum("Line1".into()),
        ),
    );
    nodes.insert(
        "TriggerActivation",
        (
            enum_node(&["RisingEdge", "FallingEdge"]),
            NodeValue::Enum("RisingEdge".into()),
        ),
    );
    nodes.insert(
        "LineSelector",
        (
            enum_node(&["Line1", "Line3", "Line4"]),
            NodeValue::Enum("Line1".into()),
        ),
    );
    nodes.insert(
        "LineMode",
        (
            enum_node(&["Input", "Output"]),
            NodeValue::Enum("Input".into()),
        ),
    );
    nodes.insert("ReverseX", (bool_node(), NodeValue::Bool(false)));
    if spec.generation == SyntheticGeneration::Usb3 {
        nodes.insert("ReverseY", (bool_node(), NodeValue::Bool(false)));
    }
    if spec.color {
        nodes.insert(
            "BalanceRatioSelector",
            (enum_node(&BALANCE_CHANNELS), NodeValue::Enum("Red".into())),
        );
        nodes.insert("BalanceRatio", (float_node(0.0, 15.98), NodeValue::Float(1.0)));
    }
    nodes.insert("MaxNumBuffer", (int_node(1.0, 256.0), NodeValue::Int(10)));
    nodes.insert("OutputQueueSize", (int_node(1.0, 256.0), NodeValue::Int(5)));
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_array(specs: Vec<SyntheticCameraSpec>) -> Box<dyn CameraArray> {
        let mut driver = SyntheticDriver::new(specs);
        let devices = driver.enumerate().unwrap();
        let mut array = driver.attach(&devices).unwrap();
        for slot in 0..array.len() {
            let dev = array.device_mut(slot).unwrap();
            dev.open().unwrap();
            dev.set_context(slot as u32 + 10);
            dev.write("AcquisitionFrameRate", NodeValue::Float(200.0))
                .unwrap();
        }
        array
    }

    #[test]
    fn array_interleaves_cameras_with_increasing_ids() {
        let mut array = open_array(vec![
            SyntheticCameraSpec::new("a"),
            SyntheticCameraSpec::new("b"),
        ]);
        array.start_grabbing(GrabStrategy::LatestImages).unwrap();
        let mut last: BTreeMap<u32, u64> = BTreeMap::new();
        for _ in 0..20 {
            match array.retrieve(Duration::from_secs(1)) {
                GrabOutcome::Frame(grab) => {
                    let marker = u64::from_le_bytes(grab.pixels[..8].try_into().unwrap());
                    assert_eq!(marker, grab.camera_frame_id);
                    if let Some(prev) = last.insert(grab.context, grab.camera_frame_id) {
                        assert!(grab.camera_frame_id > prev);
                    }
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(last.len(), 2);
    }

    #[test]
    fn silent_camera_times_out() {
        let mut array = open_array(vec![SyntheticCameraSpec {
            frame_limit: Some(2),
            ..SyntheticCameraSpec::new("a")
        }]);
        array.start_grabbing(GrabStrategy::LatestImages).unwrap();
        assert!(matches!(
            array.retrieve(Duration::from_secs(1)),
            GrabOutcome::Frame(_)
        ));
        assert!(matches!(
            array.retrieve(Duration::from_secs(1)),
            GrabOutcome::Frame(_)
        ));
        assert!(matches!(
            array.retrieve(Duration::from_millis(50)),
            GrabOutcome::Timeout
        ));
    }

    #[test]
    fn injected_faults_surface_as_outcomes() {
        let mut array = open_array(vec![SyntheticCameraSpec {
            fault: Some(SyntheticFault::IncompleteAt(0)),
            ..SyntheticCameraSpec::new("a")
        }]);
        array.start_grabbing(GrabStrategy::LatestImages).unwrap();
        assert!(matches!(
            array.retrieve(Duration::from_secs(1)),
            GrabOutcome::Incomplete { context: 10, .. }
        ));

        let mut array = open_array(vec![SyntheticCameraSpec {
            fault: Some(SyntheticFault::DeviceFailureAt(1)),
            ..SyntheticCameraSpec::new("a")
        }]);
        array.start_grabbing(GrabStrategy::LatestImages).unwrap();
        assert!(matches!(
            array.retrieve(Duration::from_secs(1)),
            GrabOutcome::Frame(_)
        ));
        assert!(matches!(
            array.retrieve(Duration::from_secs(1)),
            GrabOutcome::Failed(_)
        ));
    }

    #[test]
    fn hardware_trigger_without_pulses_never_fires() {
        let mut array = open_array(vec![SyntheticCameraSpec::new("a")]);
        let dev = array.device_mut(0).unwrap();
        dev.write("TriggerMode", NodeValue::Enum("On".into())).unwrap();
        array.start_grabbing(GrabStrategy::LatestImages).unwrap();
        assert!(matches!(
            array.retrieve(Duration::from_millis(30)),
            GrabOutcome::Timeout
        ));
    }

    #[test]
    fn pixel_format_is_locked_while_grabbing() {
        let mut cam = SyntheticCamera::new(SyntheticCameraSpec {
            color: true,
            ..SyntheticCameraSpec::new("a")
        });
        cam.open().unwrap();
        cam.write("PixelFormat", NodeValue::Enum("RGB8".into()))
            .unwrap();
        cam.start_grabbing(GrabStrategy::LatestImageOnly).unwrap();
        assert_eq!(
            cam.write("PixelFormat", NodeValue::Enum("Mono8".into())),
            Err(NodeError::AccessDenied("PixelFormat".into()))
        );
        match cam.retrieve(Duration::from_secs(1)) {
            GrabOutcome::Frame(grab) => {
                assert_eq!(grab.pixel_format, PixelFormat::Rgb8);
                assert_eq!(grab.pixels.len(), 64 * 48 * 3);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn balance_ratio_follows_selector() {
        let mut cam = SyntheticCamera::new(SyntheticCameraSpec {
            color: true,
            ..SyntheticCameraSpec::new("a")
        });
        cam.open().unwrap();
        cam.write("BalanceRatioSelector", NodeValue::Enum("Blue".into()))
            .unwrap();
        cam.write("BalanceRatio", NodeValue::Float(2.5)).unwrap();
        cam.write("BalanceRatioSelector", NodeValue::Enum("Red".into()))
            .unwrap();
        assert_eq!(cam.read("BalanceRatio").unwrap(), NodeValue::Float(1.0));
        cam.write("BalanceRatioSelector", NodeValue::Enum("Blue".into()))
            .unwrap();
        assert_eq!(cam.read("BalanceRatio").unwrap(), NodeValue::Float(2.5));
    }
}
