//! Attached camera array plus the per-camera handles.
//!
//! The acquisition thread holds the rig's lock for the whole run, so exactly one
//! thread touches the devices at any time.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::handle::{AcquisitionSettings, CameraHandle};
use super::registry::CameraRegistry;
use super::{
    CameraArray, CameraDevice, CameraDriver, ConfigurationError, DeviceInfo, GrabOutcome,
    GrabStrategy,
};
use crate::frame::Frame;

const CONTEXT_MASK: u32 = 0x00ff_ffff;

/// Which cameras a run grabs from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrabTarget {
    All,
    Single(usize),
}

/// Owned result of one grab, already routed to a slot.
#[derive(Debug)]
pub enum RigGrab {
    Frame { frame: Frame, skipped: u32 },
    Timeout,
    Incomplete { slot: Option<usize>, reason: String },
    Failed(String),
    /// The driver delivered a frame whose context matches no connected camera.
    UnknownContext(u32),
}

pub struct CameraRig {
    array: Box<dyn CameraArray>,
    handles: Vec<CameraHandle>,
    slots_by_context: HashMap<u32, usize>,
    sequences: Vec<u64>,
}

impl CameraRig {
    /// Attach `devices`, open them and give each a unique routing context.
    pub fn connect(
        driver: &mut dyn CameraDriver,
        devices: &[DeviceInfo],
        registry: &mut CameraRegistry,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(anyhow!("no cameras to connect"));
        }
        let mut array = driver.attach(devices)?;
        let mut handles = Vec::with_capacity(array.len());
        let mut used = HashSet::new();
        for slot in 0..array.len() {
            let device = array
                .device_mut(slot)
                .ok_or_else(|| anyhow!("driver lost camera in slot {}", slot))?;
            let mut entry = registry.assign(&device.info().serial);
            while !used.insert(entry.context) {
                let probed = (entry.context + 1) & CONTEXT_MASK;
                log::warn!(
                    "CameraRig: context {:#08x} of {} already in use, trying {:#08x}",
                    entry.context,
                    entry.name,
                    probed
                );
                entry.context = probed;
            }
            handles.push(CameraHandle::connect(slot, device, &entry)?);
        }
        Ok(Self::from_parts(array, handles))
    }

    fn from_parts(array: Box<dyn CameraArray>, handles: Vec<CameraHandle>) -> Self {
        let slots_by_context = handles.iter().map(|h| (h.context, h.slot)).collect();
        let sequences = vec![0; handles.len()];
        Self {
            array,
            handles,
            slots_by_context,
            sequences,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[CameraHandle] {
        &self.handles
    }

    pub fn handle(&self, slot: usize) -> Option<&CameraHandle> {
        self.handles.get(slot)
    }

    pub fn slot_for_context(&self, context: u32) -> Option<usize> {
        self.slots_by_context.get(&context).copied()
    }

    /// Handle and device for one slot, borrowed together.
    pub fn camera_mut(&mut self, slot: usize) -> Option<(&CameraHandle, &mut dyn CameraDevice)> {
        let handle = self.handles.get(slot)?;
        let device = self.array.device_mut(slot)?;
        Some((handle, device))
    }

    /// Apply run-start settings to the targeted cameras.
    pub fn configure(
        &mut self,
        target: GrabTarget,
        settings: &AcquisitionSettings,
    ) -> Vec<(usize, ConfigurationError)> {
        let mut rejected = Vec::new();
        for handle in &mut self.handles {
            if let GrabTarget::Single(slot) = target {
                if slot != handle.slot {
                    continue;
                }
            }
            let Some(device) = self.array.device_mut(handle.slot) else {
                continue;
            };
            rejected.extend(
                handle
                    .configure_acquisition(device, settings)
                    .into_iter()
                    .map(|err| (handle.slot, err)),
            );
        }
        rejected
    }

    pub fn start(&mut self, target: GrabTarget, strategy: GrabStrategy) -> Result<()> {
        self.sequences.iter_mut().for_each(|s| *s = 0);
        match target {
            GrabTarget::All => self.array.start_grabbing(strategy),
            GrabTarget::Single(slot) => self
                .array
                .device_mut(slot)
                .ok_or_else(|| anyhow!("no camera in slot {}", slot))?
                .start_grabbing(strategy),
        }
    }

    /// Fetch the next frame and copy it out of the driver buffer.
    pub fn grab(&mut self, target: GrabTarget, timeout: Duration, keep_timestamps: bool) -> RigGrab {
        let outcome = match target {
            GrabTarget::All => self.array.retrieve(timeout),
            GrabTarget::Single(slot) => match self.array.device_mut(slot) {
                Some(device) => device.retrieve(timeout),
                None => return RigGrab::Failed(format!("no camera in slot {slot}")),
            },
        };
        match outcome {
            GrabOutcome::Frame(grab) => {
                let Some(&slot) = self.slots_by_context.get(&grab.context) else {
                    return RigGrab::UnknownContext(grab.context);
                };
                let sequence = self.sequences[slot];
                self.sequences[slot] += 1;
                RigGrab::Frame {
                    frame: Frame::copy_from(&grab, slot, sequence, keep_timestamps),
                    skipped: grab.skipped,
                }
            }
            GrabOutcome::Timeout => RigGrab::Timeout,
            GrabOutcome::Incomplete { context, reason } => RigGrab::Incomplete {
                slot: self.slots_by_context.get(&context).copied(),
                reason,
            },
            GrabOutcome::Failed(message) => RigGrab::Failed(message),
        }
    }

    pub fn stop(&mut self, target: GrabTarget) {
        match target {
            GrabTarget::All => self.array.stop_grabbing(),
            GrabTarget::Single(slot) => {
                if let Some(device) = self.array.device_mut(slot) {
                    device.stop_grabbing();
                }
            }
        }
    }

    pub fn close_all(&mut self) {
        self.array.stop_grabbing();
        for handle in &self.handles {
            if let Some(device) = self.array.device_mut(handle.slot) {
                if let Err(err) = device.close() {
                    log::warn!("Camera[{}]: close failed: {}", handle.name, err);
                }
            }
        }
    }
}

impl std::fmt::Debug for CameraRig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraRig")
            .field("handles", &self.handles)
            .finish()
    }
}
