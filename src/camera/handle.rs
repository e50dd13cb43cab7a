//! What the pipeline knows about one connected camera.
//!
//! A `CameraHandle` never owns the device. Configuration methods take the device
//! from the rig by `&mut`, validate every value against the negotiated
//! capabilities first, and report rejected properties instead of failing: a
//! rejected property keeps whatever value the camera had before.

use serde::{Deserialize, Serialize};

use super::capabilities::{CameraCapabilities, ConfigurationError, Property};
use super::registry::RegistryEntry;
use super::{CameraDevice, NodeValue, TriggerMode};
use crate::frame::PixelFormat;

const BALANCE_CHANNELS: [&str; 3] = ["Red", "Green", "Blue"];

/// User-facing camera settings. One entry of a settings file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_time: Option<f64>,
    #[serde(rename = "flipX", default)]
    pub flip_x: bool,
    #[serde(rename = "flipY", default)]
    pub flip_y: bool,
    /// `[red, green, blue]` balance ratios.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_balance: Option<[f64; 3]>,
    /// Pixel format entry, e.g. `Mono8` or `BGR8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_mode: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraLimits {
    pub gain: Option<(f64, f64)>,
    pub exposure: Option<(f64, f64)>,
    pub frame_rate: Option<(f64, f64)>,
    pub pixel_formats: Vec<PixelFormat>,
    pub is_color: bool,
}

/// Applied to every camera when a run starts.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionSettings {
    pub trigger: TriggerMode,
    /// Free-run frame rate.
    pub frame_rate: f64,
    /// Frame rate ceiling while hardware triggered. Clamped to the device maximum.
    pub hardware_trigger_frame_rate: f64,
    pub trigger_line: String,
    pub max_num_buffer: u32,
    pub output_queue_size: u32,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            trigger: TriggerMode::FreeRun,
            frame_rate: 10.0,
            hardware_trigger_frame_rate: 200.0,
            trigger_line: "Line3".to_string(),
            max_num_buffer: 16,
            output_queue_size: 8,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CameraHandle {
    pub slot: usize,
    pub serial: String,
    pub model: String,
    pub name: String,
    pub context: u32,
    capabilities: CameraCapabilities,
    trigger: TriggerMode,
    frame_rate: Option<f64>,
}

impl CameraHandle {
    /// Open `device` if needed, stamp its routing context and negotiate capabilities.
    pub fn connect(
        slot: usize,
        device: &mut dyn CameraDevice,
        entry: &RegistryEntry,
    ) -> anyhow::Result<Self> {
        if !device.is_open() {
            device.open()?;
        }
        device.set_context(entry.context);
        let capabilities = CameraCapabilities::negotiate(device);
        let info = device.info();
        log::info!(
            "Camera[{}]: connected {} {} in slot {} (context {:#08x}, {})",
            entry.name,
            info.model,
            info.serial,
            slot,
            entry.context,
            if capabilities.is_color() { "color" } else { "mono" }
        );
        Ok(Self {
            slot,
            serial: info.serial.clone(),
            model: info.model.clone(),
            name: entry.name.clone(),
            context: entry.context,
            capabilities,
            trigger: TriggerMode::FreeRun,
            frame_rate: None,
        })
    }

    pub fn capabilities(&self) -> &CameraCapabilities {
        &self.capabilities
    }

    pub fn trigger(&self) -> TriggerMode {
        self.trigger
    }

    /// Frame rate written at the last run start.
    pub fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    /// Validate and write one property.
    pub fn set(
        &self,
        device: &mut dyn CameraDevice,
        property: Property,
        value: NodeValue,
    ) -> Result<(), ConfigurationError> {
        let (node, value) = self.capabilities.validate(property, value)?;
        device
            .write(node, value)
            .map_err(|err| ConfigurationError::from_node(property, err))
    }

    fn set_logged(
        &self,
        device: &mut dyn CameraDevice,
        property: Property,
        value: NodeValue,
        rejected: &mut Vec<ConfigurationError>,
    ) {
        if let Err(err) = self.set(device, property, value) {
            log::warn!("Camera[{}]: {}", self.name, err);
            rejected.push(err);
        }
    }

    fn read(&self, device: &dyn CameraDevice, property: Property) -> Option<NodeValue> {
        let node = self.capabilities.node_name(property)?;
        device.read(node).ok()
    }

    fn clamp_rate(&self, requested: f64) -> f64 {
        match self.capabilities.frame_rate_range() {
            Some((min, max)) if requested < min || requested > max => {
                let clamped = requested.clamp(min, max);
                log::info!(
                    "Camera[{}]: frame rate {} outside {}..={}, using {}",
                    self.name,
                    requested,
                    min,
                    max,
                    clamped
                );
                clamped
            }
            _ => requested,
        }
    }

    /// Write the run-start configuration. Returns every property the camera refused.
    pub fn configure_acquisition(
        &mut self,
        device: &mut dyn CameraDevice,
        settings: &AcquisitionSettings,
    ) -> Vec<ConfigurationError> {
        let mut rejected = Vec::new();
        let rate = match settings.trigger {
            TriggerMode::FreeRun => self.clamp_rate(settings.frame_rate),
            TriggerMode::Hardware => self.clamp_rate(settings.hardware_trigger_frame_rate),
        };
        // The trigger mode has to be released first or the rate node may be locked.
        self.set_logged(
            device,
            Property::TriggerMode,
            NodeValue::Enum("Off".into()),
            &mut rejected,
        );
        self.set_logged(device, Property::FrameRate, NodeValue::Float(rate), &mut rejected);
        if self.capabilities.supports(Property::FrameRateEnable) {
            self.set_logged(
                device,
                Property::FrameRateEnable,
                NodeValue::Bool(true),
                &mut rejected,
            );
        }
        self.set_logged(
            device,
            Property::MaxNumBuffer,
            NodeValue::Int(settings.max_num_buffer as i64),
            &mut rejected,
        );
        self.set_logged(
            device,
            Property::OutputQueueSize,
            NodeValue::Int(settings.output_queue_size as i64),
            &mut rejected,
        );
        self.set_logged(
            device,
            Property::AcquisitionMode,
            NodeValue::Enum("Continuous".into()),
            &mut rejected,
        );

        if settings.trigger == TriggerMode::Hardware {
            let line = NodeValue::Enum(settings.trigger_line.clone());
            let steps = [
                (Property::LineSelector, line.clone()),
                (Property::LineMode, NodeValue::Enum("Input".into())),
                (Property::TriggerSelector, NodeValue::Enum("FrameStart".into())),
                (Property::TriggerSource, line),
                (Property::TriggerActivation, NodeValue::Enum("RisingEdge".into())),
                (Property::TriggerMode, NodeValue::Enum("On".into())),
            ];
            for (property, value) in steps {
                self.set_logged(device, property, value, &mut rejected);
            }
        }

        self.trigger = settings.trigger;
        self.frame_rate = self
            .read(device, Property::FrameRate)
            .and_then(|v| v.as_f64());
        log::info!(
            "Camera[{}]: configured {:?} at {:.1} fps ({} rejected)",
            self.name,
            self.trigger,
            self.frame_rate.unwrap_or(rate),
            rejected.len()
        );
        rejected
    }

    pub fn set_gain_exposure(
        &self,
        device: &mut dyn CameraDevice,
        gain: f64,
        exposure: f64,
    ) -> Vec<ConfigurationError> {
        let mut rejected = Vec::new();
        self.set_logged(device, Property::Gain, NodeValue::Float(gain), &mut rejected);
        self.set_logged(
            device,
            Property::ExposureTime,
            NodeValue::Float(exposure),
            &mut rejected,
        );
        rejected
    }

    pub fn set_color_mode(
        &self,
        device: &mut dyn CameraDevice,
        mode: &str,
    ) -> Result<(), ConfigurationError> {
        self.set(device, Property::PixelFormat, NodeValue::Enum(mode.to_string()))
            .inspect_err(|err| log::info!("Camera[{}]: {}", self.name, err))
    }

    /// Toggle horizontal flip. Returns the new state.
    pub fn flip_x(&self, device: &mut dyn CameraDevice) -> Result<bool, ConfigurationError> {
        self.toggle(device, Property::ReverseX)
    }

    /// Toggle vertical flip. Returns the new state.
    pub fn flip_y(&self, device: &mut dyn CameraDevice) -> Result<bool, ConfigurationError> {
        self.toggle(device, Property::ReverseY)
    }

    fn toggle(
        &self,
        device: &mut dyn CameraDevice,
        property: Property,
    ) -> Result<bool, ConfigurationError> {
        let current = self
            .read(device, property)
            .and_then(|v| v.as_bool())
            .ok_or(ConfigurationError::Unsupported { property })?;
        self.set(device, property, NodeValue::Bool(!current))
            .inspect_err(|err| log::info!("Camera[{}]: {}", self.name, err))?;
        Ok(!current)
    }

    pub fn set_color_balance(
        &self,
        device: &mut dyn CameraDevice,
        ratios: [f64; 3],
    ) -> Vec<ConfigurationError> {
        let mut rejected = Vec::new();
        if !self.capabilities.is_color() || !self.capabilities.supports(Property::BalanceRatio) {
            log::info!("Camera[{}]: not a color camera, skipping white balance", self.name);
            rejected.push(ConfigurationError::Unsupported {
                property: Property::BalanceRatio,
            });
            return rejected;
        }
        for (channel, ratio) in BALANCE_CHANNELS.iter().zip(ratios) {
            if let Err(err) = self.set(
                device,
                Property::BalanceRatioSelector,
                NodeValue::Enum(channel.to_string()),
            ) {
                log::warn!("Camera[{}]: {}", self.name, err);
                rejected.push(err);
                continue;
            }
            self.set_logged(device, Property::BalanceRatio, NodeValue::Float(ratio), &mut rejected);
        }
        rejected
    }

    fn color_balance(&self, device: &mut dyn CameraDevice) -> Option<[f64; 3]> {
        if !self.capabilities.is_color() {
            return None;
        }
        let mut out = [0.0; 3];
        for (slot, channel) in out.iter_mut().zip(BALANCE_CHANNELS) {
            self.set(
                device,
                Property::BalanceRatioSelector,
                NodeValue::Enum(channel.to_string()),
            )
            .ok()?;
            *slot = self.read(device, Property::BalanceRatio)?.as_f64()?;
        }
        Some(out)
    }

    /// Current values as a settings-file entry. Unsupported properties are left out.
    pub fn settings(&self, device: &mut dyn CameraDevice) -> CameraSettings {
        let flag = |p| {
            self.read(device, p)
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        };
        let flip_x = flag(Property::ReverseX);
        let flip_y = flag(Property::ReverseY);
        CameraSettings {
            gain: self.read(device, Property::Gain).and_then(|v| v.as_f64()),
            exp_time: self
                .read(device, Property::ExposureTime)
                .and_then(|v| v.as_f64()),
            flip_x,
            flip_y,
            color_mode: self
                .read(device, Property::PixelFormat)
                .and_then(|v| v.as_enum().map(str::to_string)),
            color_balance: self.color_balance(device),
        }
    }

    /// Apply a settings-file entry, property by property.
    pub fn apply_settings(
        &self,
        device: &mut dyn CameraDevice,
        settings: &CameraSettings,
    ) -> Vec<ConfigurationError> {
        let mut rejected = Vec::new();
        if let Some(gain) = settings.gain {
            self.set_logged(device, Property::Gain, NodeValue::Float(gain), &mut rejected);
        }
        if let Some(exposure) = settings.exp_time {
            self.set_logged(
                device,
                Property::ExposureTime,
                NodeValue::Float(exposure),
                &mut rejected,
            );
        }
        if let Some(mode) = &settings.color_mode {
            self.set_logged(
                device,
                Property::PixelFormat,
                NodeValue::Enum(mode.clone()),
                &mut rejected,
            );
        }
        for (property, wanted) in [
            (Property::ReverseX, settings.flip_x),
            (Property::ReverseY, settings.flip_y),
        ] {
            // Absent flip nodes only matter when a flip is actually requested.
            if wanted || self.capabilities.supports(property) {
                self.set_logged(device, property, NodeValue::Bool(wanted), &mut rejected);
            }
        }
        if let Some(ratios) = settings.color_balance {
            if self.capabilities.is_color() {
                rejected.extend(self.set_color_balance(device, ratios));
            }
        }
        rejected
    }

    pub fn limits(&self) -> CameraLimits {
        CameraLimits {
            gain: self.capabilities.gain_range(),
            exposure: self.capabilities.exposure_range(),
            frame_rate: self.capabilities.frame_rate_range(),
            pixel_formats: self.capabilities.pixel_formats(),
            is_color: self.capabilities.is_color(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::synthetic::{SyntheticCamera, SyntheticCameraSpec, SyntheticGeneration};

    fn connect(spec: SyntheticCameraSpec) -> (SyntheticCamera, CameraHandle) {
        let mut cam = SyntheticCamera::new(spec);
        let entry = RegistryEntry {
            name: "cam00".into(),
            context: 42,
        };
        let handle = CameraHandle::connect(0, &mut cam, &entry).unwrap();
        (cam, handle)
    }

    #[test]
    fn connect_opens_and_sets_context() {
        let (cam, handle) = connect(SyntheticCameraSpec::new("s1"));
        assert!(cam.is_open());
        assert_eq!(cam.context(), 42);
        assert_eq!(handle.serial, "s1");
    }

    #[test]
    fn free_run_configuration_writes_rate() {
        let (mut cam, mut handle) = connect(SyntheticCameraSpec::new("s1"));
        let settings = AcquisitionSettings {
            frame_rate: 40.0,
            ..AcquisitionSettings::default()
        };
        let rejected = handle.configure_acquisition(&mut cam, &settings);
        assert!(rejected.is_empty(), "{rejected:?}");
        assert_eq!(handle.frame_rate(), Some(40.0));
        assert_eq!(
            cam.read("TriggerMode").unwrap(),
            NodeValue::Enum("Off".into())
        );
    }

    #[test]
    fn hardware_trigger_rate_is_clamped_to_device_max() {
        let (mut cam, mut handle) = connect(SyntheticCameraSpec::new("s1"));
        let (_, max) = handle.capabilities().frame_rate_range().unwrap();
        let settings = AcquisitionSettings {
            trigger: TriggerMode::Hardware,
            hardware_trigger_frame_rate: max + 1000.0,
            ..AcquisitionSettings::default()
        };
        let rejected = handle.configure_acquisition(&mut cam, &settings);
        assert!(rejected.is_empty(), "{rejected:?}");
        assert_eq!(handle.frame_rate(), Some(max));
        assert_eq!(cam.read("TriggerMode").unwrap(), NodeValue::Enum("On".into()));
        assert_eq!(
            cam.read("TriggerSource").unwrap(),
            NodeValue::Enum("Line3".into())
        );
    }

    #[test]
    fn rejected_gain_keeps_previous_value() {
        let (mut cam, handle) = connect(SyntheticCameraSpec::new("s1"));
        let before = cam.read("Gain").unwrap();
        let rejected = handle.set_gain_exposure(&mut cam, 1.0e6, 8000.0);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].property(), Property::Gain);
        assert_eq!(cam.read("Gain").unwrap(), before);
        assert_eq!(cam.read("ExposureTime").unwrap(), NodeValue::Float(8000.0));
    }

    #[test]
    fn flips_toggle_and_missing_flip_is_unsupported() {
        let (mut cam, handle) = connect(SyntheticCameraSpec::new("s1"));
        assert_eq!(handle.flip_x(&mut cam), Ok(true));
        assert_eq!(handle.flip_x(&mut cam), Ok(false));

        let (mut gige, handle) = connect(SyntheticCameraSpec {
            generation: SyntheticGeneration::Gige,
            ..SyntheticCameraSpec::new("s2")
        });
        assert_eq!(
            handle.flip_y(&mut gige),
            Err(ConfigurationError::Unsupported {
                property: Property::ReverseY
            })
        );
    }

    #[test]
    fn settings_snapshot_round_trips_through_apply() {
        let (mut cam, handle) = connect(SyntheticCameraSpec {
            color: true,
            ..SyntheticCameraSpec::new("s1")
        });
        let wanted = CameraSettings {
            gain: Some(3.0),
            exp_time: Some(2500.0),
            flip_x: true,
            flip_y: false,
            color_balance: Some([1.5, 1.0, 2.0]),
            color_mode: Some("RGB8".into()),
        };
        let rejected = handle.apply_settings(&mut cam, &wanted);
        assert!(rejected.is_empty(), "{rejected:?}");
        assert_eq!(handle.settings(&mut cam), wanted);
    }

    #[test]
    fn mono_camera_refuses_white_balance() {
        let (mut cam, handle) = connect(SyntheticCameraSpec::new("s1"));
        let rejected = handle.set_color_balance(&mut cam, [1.0, 1.0, 1.0]);
        assert_eq!(rejected.len(), 1);
        assert!(!handle.limits().is_color);
        assert_eq!(handle.limits().pixel_formats, vec![PixelFormat::Mono8]);
    }
}
