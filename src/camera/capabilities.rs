//! Capability negotiation.
//!
//! Camera generations expose the same feature under different node names
//! (`AcquisitionFrameRate` vs `AcquisitionFrameRateAbs`, `ExposureTime` vs
//! `ExposureTimeAbs`), and some models lack a feature entirely. `CameraCapabilities`
//! probes every alias once at connect time; configuration code then looks up the
//! resolved node instead of trying names until one works.

use std::collections::HashMap;
use std::fmt;

use super::{CameraDevice, NodeError, NodeInfo, NodeKind, NodeValue};
use crate::frame::PixelFormat;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Property {
    FrameRate,
    FrameRateEnable,
    Gain,
    ExposureTime,
    PixelFormat,
    AcquisitionMode,
    TriggerMode,
    TriggerSelector,
    TriggerSource,
    TriggerActivation,
    LineSelector,
    LineMode,
    ReverseX,
    ReverseY,
    BalanceRatioSelector,
    BalanceRatio,
    MaxNumBuffer,
    OutputQueueSize,
}

impl Property {
    pub const ALL: [Property; 18] = [
        Property::FrameRate,
        Property::FrameRateEnable,
        Property::Gain,
        Property::ExposureTime,
        Property::PixelFormat,
        Property::AcquisitionMode,
        Property::TriggerMode,
        Property::TriggerSelector,
        Property::TriggerSource,
        Property::TriggerActivation,
        Property::LineSelector,
        Property::LineMode,
        Property::ReverseX,
        Property::ReverseY,
        Property::BalanceRatioSelector,
        Property::BalanceRatio,
        Property::MaxNumBuffer,
        Property::OutputQueueSize,
    ];

    /// Node names to try, newest camera generation first.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Property::FrameRate => &["AcquisitionFrameRate", "AcquisitionFrameRateAbs"],
            Property::FrameRateEnable => &["AcquisitionFrameRateEnable"],
            Property::Gain => &["Gain", "GainRaw"],
            Property::ExposureTime => &["ExposureTime", "ExposureTimeAbs"],
            Property::PixelFormat => &["PixelFormat"],
            Property::AcquisitionMode => &["AcquisitionMode"],
            Property::TriggerMode => &["TriggerMode"],
            Property::TriggerSelector => &["TriggerSelector"],
            Property::TriggerSource => &["TriggerSource"],
            Property::TriggerActivation => &["TriggerActivation"],
            Property::LineSelector => &["LineSelector"],
            Property::LineMode => &["LineMode"],
            Property::ReverseX => &["ReverseX"],
            Property::ReverseY => &["ReverseY"],
            Property::BalanceRatioSelector => &["BalanceRatioSelector"],
            Property::BalanceRatio => &["BalanceRatio", "BalanceRatioAbs"],
            Property::MaxNumBuffer => &["MaxNumBuffer"],
            Property::OutputQueueSize => &["OutputQueueSize"],
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.aliases()[0])
    }
}

/// A configuration request the camera could not honor. Never fatal: the camera
/// keeps its previous value.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigurationError {
    Unsupported {
        property: Property,
    },
    OutOfRange {
        property: Property,
        value: f64,
        min: f64,
        max: f64,
    },
    InvalidEntry {
        property: Property,
        value: String,
    },
    NotWritable {
        property: Property,
    },
    Rejected {
        property: Property,
        reason: String,
    },
}

impl ConfigurationError {
    pub fn property(&self) -> Property {
        match self {
            ConfigurationError::Unsupported { property }
            | ConfigurationError::OutOfRange { property, .. }
            | ConfigurationError::InvalidEntry { property, .. }
            | ConfigurationError::NotWritable { property }
            | ConfigurationError::Rejected { property, .. } => *property,
        }
    }

    pub(crate) fn from_node(property: Property, err: NodeError) -> Self {
        match err {
            NodeError::NotAvailable(_) => ConfigurationError::Unsupported { property },
            NodeError::AccessDenied(_) => ConfigurationError::NotWritable { property },
            other => ConfigurationError::Rejected {
                property,
                reason: other.to_string(),
            },
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::Unsupported { property } => {
                write!(f, "{property} is not available on this camera")
            }
            ConfigurationError::OutOfRange {
                property,
                value,
                min,
                max,
            } => write!(f, "{property} value {value} is outside {min}..={max}"),
            ConfigurationError::InvalidEntry { property, value } => {
                write!(f, "{property} has no entry '{value}'")
            }
            ConfigurationError::NotWritable { property } => {
                write!(f, "{property} cannot be written while the camera is running")
            }
            ConfigurationError::Rejected { property, reason } => {
                write!(f, "{property} rejected: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// A property resolved to a concrete node on one camera.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedNode {
    pub name: &'static str,
    pub info: NodeInfo,
}

/// Per-camera capability table, computed once at connect time.
#[derive(Clone, Debug, Default)]
pub struct CameraCapabilities {
    nodes: HashMap<Property, ResolvedNode>,
    is_color: bool,
}

impl CameraCapabilities {
    pub fn negotiate(device: &dyn CameraDevice) -> Self {
        let mut nodes = HashMap::new();
        for property in Property::ALL {
            let resolved = property
                .aliases()
                .iter()
                .find_map(|&name| device.node(name).map(|info| ResolvedNode { name, info }));
            if let Some(resolved) = resolved {
                nodes.insert(property, resolved);
            }
        }
        let is_color = nodes
            .get(&Property::PixelFormat)
            .map(|node| {
                node.info
                    .entries
                    .iter()
                    .any(|e| matches!(e.as_str(), "BGR8" | "BGR8Packed" | "RGB8" | "RGB8Packed"))
            })
            .unwrap_or(false);
        Self { nodes, is_color }
    }

    pub fn supports(&self, property: Property) -> bool {
        self.nodes.contains_key(&property)
    }

    pub fn node(&self, property: Property) -> Option<&ResolvedNode> {
        self.nodes.get(&property)
    }

    pub fn node_name(&self, property: Property) -> Option<&'static str> {
        self.nodes.get(&property).map(|n| n.name)
    }

    pub fn range(&self, property: Property) -> Option<(f64, f64)> {
        let info = &self.nodes.get(&property)?.info;
        Some((info.min?, info.max?))
    }

    pub fn gain_range(&self) -> Option<(f64, f64)> {
        self.range(Property::Gain)
    }

    pub fn exposure_range(&self) -> Option<(f64, f64)> {
        self.range(Property::ExposureTime)
    }

    pub fn frame_rate_range(&self) -> Option<(f64, f64)> {
        self.range(Property::FrameRate)
    }

    /// Pixel formats the pipeline can consume that this camera offers.
    pub fn pixel_formats(&self) -> Vec<PixelFormat> {
        self.nodes
            .get(&Property::PixelFormat)
            .map(|n| {
                n.info
                    .entries
                    .iter()
                    .filter_map(|e| e.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Color sensor. Gates white balance and color conversion.
    pub fn is_color(&self) -> bool {
        self.is_color
    }

    /// Check `value` against the negotiated node and build the device value.
    pub fn validate(
        &self,
        property: Property,
        value: NodeValue,
    ) -> Result<(&'static str, NodeValue), ConfigurationError> {
        let node = self
            .nodes
            .get(&property)
            .ok_or(ConfigurationError::Unsupported { property })?;
        if !node.info.writable {
            return Err(ConfigurationError::NotWritable { property });
        }
        let mismatch = |value: &NodeValue| ConfigurationError::Rejected {
            property,
            reason: format!("value {value} does not match node type"),
        };
        let value = match node.info.kind {
            NodeKind::Float | NodeKind::Int => {
                let x = value.as_f64().ok_or_else(|| mismatch(&value))?;
                let min = node.info.min.unwrap_or(f64::MIN);
                let max = node.info.max.unwrap_or(f64::MAX);
                if x < min || x > max {
                    return Err(ConfigurationError::OutOfRange {
                        property,
                        value: x,
                        min,
                        max,
                    });
                }
                if node.info.kind == NodeKind::Int {
                    NodeValue::Int(x.round() as i64)
                } else {
                    NodeValue::Float(x)
                }
            }
            NodeKind::Bool => NodeValue::Bool(value.as_bool().ok_or_else(|| mismatch(&value))?),
            NodeKind::Enum => {
                let entry = value.as_enum().ok_or_else(|| mismatch(&value))?;
                if !node.info.entries.iter().any(|e| e == entry) {
                    return Err(ConfigurationError::InvalidEntry {
                        property,
                        value: entry.to_string(),
                    });
                }
                NodeValue::Enum(entry.to_string())
            }
        };
        Ok((node.name, value))
    }
}
