//! Session coordinator.
//!
//! The only component the control layer talks to. It owns the camera rig, the
//! acquisition loop and the per-camera encoders, and serializes every
//! transition between `Idle`, `Viewing` and `Recording`:
//!
//! - start operations take the coordinator lock with `try_lock`, so a start that
//!   races a running stop is rejected as `Busy` instead of interleaving;
//! - `stop` always runs the same teardown: cancel and join acquisition, drain and
//!   stop each encoder, clear queues, clear the sticky fault, go `Idle`;
//! - `poll_status` notices a fault raised by a worker thread and runs the same
//!   teardown, but keeps the fault for the operator to see.
//!
//! Camera configuration is only accepted while `Idle`.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, TryLockError};

use crate::acquisition::{AcquisitionLoop, AcquisitionPlan, AcquisitionStats, Route};
use crate::camera::rig::{CameraRig, GrabTarget};
use crate::camera::{
    CameraDevice, CameraDriver, CameraHandle, CameraLimits, CameraRegistry, CameraSettings,
    ConfigurationError, DeviceInfo, GrabStrategy,
};
use crate::config::{RecorderConfig, SettingsFile};
use crate::encoder::{
    AsyncVideoEncoder, DrainOutcome, DrainPolicy, EncoderBackend, EncoderSettings, ProcessBackend,
};
use crate::fault::{Fault, SessionSignals};
use crate::frame::Frame;
use crate::queue::BoundedQueue;
use crate::status::{CameraStatus, EncoderStatus, SessionState, SessionStatus};

/// Session ids end up in file names.
pub const SESSION_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$";

#[derive(Clone, Debug, PartialEq)]
pub enum SessionError {
    /// Another transition holds the coordinator.
    Busy,
    AlreadyRunning(SessionState),
    NotIdle(SessionState),
    NotConnected,
    NoCameras,
    NoSuchCamera(usize),
    /// A previous run ended in a fault that has not been cleared by `stop`.
    StickyFault(Fault),
    InvalidSessionId(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Busy => f.write_str("another start/stop is in progress"),
            SessionError::AlreadyRunning(state) => write!(f, "session is already {state}"),
            SessionError::NotIdle(state) => {
                write!(f, "cameras cannot be configured while {state}")
            }
            SessionError::NotConnected => f.write_str("no cameras connected"),
            SessionError::NoCameras => f.write_str("no cameras found"),
            SessionError::NoSuchCamera(slot) => write!(f, "no camera in slot {slot}"),
            SessionError::StickyFault(fault) => {
                write!(f, "previous run failed ({fault}); stop to reset")
            }
            SessionError::InvalidSessionId(id) => {
                write!(f, "session id '{id}' must match {SESSION_ID_PATTERN}")
            }
        }
    }
}

impl std::error::Error for SessionError {}

pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    static SESSION_ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = SESSION_ID_RE.get_or_init(|| Regex::new(SESSION_ID_PATTERN).unwrap());
    if re.is_match(id) {
        Ok(())
    } else {
        Err(SessionError::InvalidSessionId(id.to_string()))
    }
}

/// Per-take overrides for `start_recording_with`.
#[derive(Clone, Debug, Default)]
pub struct RecordOptions {
    pub fps: Option<u32>,
    pub settings_file: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraSummary {
    pub slot: usize,
    pub serial: String,
    pub model: String,
    pub name: String,
    pub context: u32,
    pub is_color: bool,
}

impl CameraSummary {
    fn of(handle: &CameraHandle) -> Self {
        Self {
            slot: handle.slot,
            serial: handle.serial.clone(),
            model: handle.model.clone(),
            name: handle.name.clone(),
            context: handle.context,
            is_color: handle.capabilities().is_color(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingInfo {
    pub session_id: String,
    pub timestamp: String,
    pub files: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StopReport {
    pub stopped: Option<SessionState>,
    pub fault: Option<Fault>,
    pub files: Vec<PathBuf>,
    pub frames_written: Vec<u64>,
    pub errors: Vec<String>,
}

#[derive(Default)]
struct Published {
    cameras: Vec<CameraSummary>,
    session_id: Option<String>,
    previews: Vec<Option<Arc<BoundedQueue<Frame>>>>,
    encoders: Vec<Option<Arc<AsyncVideoEncoder>>>,
    stats: Option<Arc<AcquisitionStats>>,
}

struct ActiveRun {
    acquisition: AcquisitionLoop,
    encoders: Vec<Arc<AsyncVideoEncoder>>,
    previews: Vec<Arc<BoundedQueue<Frame>>>,
}

struct Inner {
    driver: Box<dyn CameraDriver>,
    registry: CameraRegistry,
    devices: Vec<DeviceInfo>,
    rig: Option<Arc<Mutex<CameraRig>>>,
    run: Option<ActiveRun>,
}

#[derive(Clone, Copy)]
enum RunKind {
    View(GrabTarget),
    Record,
}

pub struct SessionCoordinator {
    config: RecorderConfig,
    backend: Arc<dyn EncoderBackend>,
    signals: Arc<SessionSignals>,
    state: AtomicU8,
    drain: DrainPolicy,
    inner: Mutex<Inner>,
    published: RwLock<Published>,
}

impl SessionCoordinator {
    pub fn new(
        config: RecorderConfig,
        driver: Box<dyn CameraDriver>,
        backend: Arc<dyn EncoderBackend>,
    ) -> Self {
        let registry = config
            .camera_registry
            .as_deref()
            .map(CameraRegistry::load)
            .unwrap_or_default();
        Self {
            config,
            backend,
            signals: Arc::new(SessionSignals::new()),
            state: AtomicU8::new(SessionState::Idle as u8),
            drain: DrainPolicy::default(),
            inner: Mutex::new(Inner {
                driver,
                registry,
                devices: Vec::new(),
                rig: None,
                run: None,
            }),
            published: RwLock::new(Published::default()),
        }
    }

    /// Synthetic cameras and the ffmpeg encoder backend, as configured.
    pub fn with_synthetic_driver(config: RecorderConfig) -> Self {
        let driver = Box::new(config.synthetic.driver());
        let backend = Arc::new(ProcessBackend::new(config.encoder.ffmpeg_program.clone()));
        Self::new(config, driver, backend)
    }

    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain = policy;
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Last published state. A run that died on a fault keeps reporting its
    /// running state until `poll_status` (or `stop`) tears it down.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Whether a worker raised a fatal fault. Does not stop the run; only
    /// `poll_status` performs the automatic teardown.
    pub fn has_fault(&self) -> bool {
        self.signals.has_fault()
    }

    pub fn fault(&self) -> Option<Fault> {
        self.signals.fault()
    }

    fn try_inner(&self) -> Result<MutexGuard<'_, Inner>, SessionError> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(SessionError::Busy),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_idle(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Idle => Ok(()),
            state => Err(SessionError::NotIdle(state)),
        }
    }

    fn read_published(&self) -> std::sync::RwLockReadGuard<'_, Published> {
        self.published.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_published(&self) -> std::sync::RwLockWriteGuard<'_, Published> {
        self.published.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enumerate attached cameras.
    pub fn scan(&self) -> Result<Vec<DeviceInfo>> {
        let mut inner = self.try_inner()?;
        self.require_idle()?;
        let devices = inner.driver.enumerate().context("enumerating cameras")?;
        log::info!("SessionCoordinator: found {} cameras", devices.len());
        for device in &devices {
            log::info!(
                "SessionCoordinator:   {} {} ({})",
                device.vendor,
                device.model,
                device.serial
            );
        }
        inner.devices = devices.clone();
        Ok(devices)
    }

    /// Attach and open the scanned cameras. Scans first if nothing was scanned.
    pub fn connect(&self) -> Result<Vec<CameraSummary>> {
        let mut inner = self.try_inner()?;
        self.require_idle()?;
        if let Some(previous) = inner.rig.take() {
            lock_rig_blocking(&previous).close_all();
        }
        if inner.devices.is_empty() {
            inner.devices = inner.driver.enumerate().context("enumerating cameras")?;
        }
        if inner.devices.is_empty() {
            return Err(SessionError::NoCameras.into());
        }
        let devices = inner.devices.clone();
        let Inner {
            driver, registry, ..
        } = &mut *inner;
        let rig = CameraRig::connect(driver.as_mut(), &devices, registry)?;
        if let Some(path) = &self.config.camera_registry {
            if let Err(err) = registry.save(path) {
                log::warn!("SessionCoordinator: cannot save camera registry: {:#}", err);
            }
        }
        let cameras: Vec<CameraSummary> = rig.handles().iter().map(CameraSummary::of).collect();
        self.write_published().cameras = cameras.clone();
        inner.rig = Some(Arc::new(Mutex::new(rig)));
        log::info!("SessionCoordinator: connected {} cameras", cameras.len());
        Ok(cameras)
    }

    /// Stop any run and close every camera.
    pub fn disconnect(&self) -> Result<()> {
        self.stop()?;
        let mut inner = self.lock_inner();
        if let Some(rig) = inner.rig.take() {
            lock_rig_blocking(&rig).close_all();
            log::info!("SessionCoordinator: cameras disconnected");
        }
        self.write_published().cameras.clear();
        Ok(())
    }

    pub fn cameras(&self) -> Vec<CameraSummary> {
        self.read_published().cameras.clone()
    }

    pub fn start_viewing(&self) -> Result<()> {
        self.begin(RunKind::View(GrabTarget::All), None).map(|_| ())
    }

    /// Preview one camera through its own blocking retrieve.
    pub fn start_single_view(&self, slot: usize) -> Result<()> {
        self.begin(RunKind::View(GrabTarget::Single(slot)), None)
            .map(|_| ())
    }

    pub fn start_recording(&self, session_id: &str) -> Result<RecordingInfo> {
        self.start_recording_with(session_id, &RecordOptions::default())
    }

    pub fn start_recording_with(
        &self,
        session_id: &str,
        options: &RecordOptions,
    ) -> Result<RecordingInfo> {
        self.begin(RunKind::Record, Some((session_id, options)))?
            .ok_or_else(|| anyhow!("recording started without file information"))
    }

    fn begin(
        &self,
        kind: RunKind,
        record: Option<(&str, &RecordOptions)>,
    ) -> Result<Option<RecordingInfo>> {
        let mut inner = self.try_inner()?;
        let state = self.state();
        if state != SessionState::Idle {
            return Err(SessionError::AlreadyRunning(state).into());
        }
        if let Some(fault) = self.signals.fault() {
            return Err(SessionError::StickyFault(fault).into());
        }
        if let Some((session_id, _)) = record {
            validate_session_id(session_id)?;
        }
        let rig = inner.rig.clone().ok_or(SessionError::NotConnected)?;

        let mut config = self.config.clone();
        let settings_file = match record.and_then(|(_, o)| o.settings_file.as_deref()) {
            Some(path) => Some(SettingsFile::load(path)?),
            None => None,
        };
        if let Some(file) = &settings_file {
            file.apply_general(&mut config)?;
        }
        if let Some(fps) = record.and_then(|(_, o)| o.fps) {
            config.frame_rate = config.clamp_frame_rate(fps);
        }

        let (target, strategy, next_state) = match kind {
            RunKind::View(target) => (target, GrabStrategy::LatestImageOnly, SessionState::Viewing),
            RunKind::Record => (
                GrabTarget::All,
                GrabStrategy::LatestImages,
                SessionState::Recording,
            ),
        };

        let handles: Vec<CameraHandle> = {
            let mut guard = lock_rig(&rig)?;
            if let GrabTarget::Single(slot) = target {
                if slot >= guard.len() {
                    return Err(SessionError::NoSuchCamera(slot).into());
                }
            }
            if let Some(file) = &settings_file {
                apply_settings_file(&mut guard, file);
            }
            let rejected = guard.configure(target, &config.acquisition_settings());
            if !rejected.is_empty() {
                log::info!(
                    "SessionCoordinator: {} camera properties kept their previous value",
                    rejected.len()
                );
            }
            guard.handles().to_vec()
        };

        let targeted = |slot: usize| match target {
            GrabTarget::All => true,
            GrabTarget::Single(only) => only == slot,
        };
        let previews: Vec<Option<Arc<BoundedQueue<Frame>>>> = handles
            .iter()
            .map(|h| {
                (config.preview.enabled && targeted(h.slot))
                    .then(|| Arc::new(BoundedQueue::new(config.preview.queue_capacity)))
            })
            .collect();

        let (encoders, info): (Vec<Option<Arc<AsyncVideoEncoder>>>, Option<RecordingInfo>) =
            match record {
                Some((session_id, _)) => {
                    let (encoders, info) = self.build_encoders(&config, session_id, &handles)?;
                    (encoders.into_iter().map(Some).collect(), Some(info))
                }
                None => (vec![None; handles.len()], None),
            };

        let routes: Vec<Route> = previews
            .iter()
            .zip(&encoders)
            .map(|(preview, encoder)| Route {
                encoder: encoder.clone(),
                preview: preview.clone(),
            })
            .collect();
        let plan = AcquisitionPlan {
            target,
            strategy,
            grab_timeout: config.acquisition.grab_timeout,
            grab_poll: config.acquisition.grab_poll,
            keep_timestamps: record.is_some() && config.encoder.write_timestamps,
        };

        self.signals.rearm();
        let acquisition = AcquisitionLoop::spawn(rig, routes, plan, self.signals.clone())?;
        {
            let mut published = self.write_published();
            published.session_id = info.as_ref().map(|i| i.session_id.clone());
            published.previews = previews.clone();
            published.encoders = encoders.clone();
            published.stats = Some(acquisition.shared_stats());
        }
        self.set_state(next_state);
        inner.run = Some(ActiveRun {
            acquisition,
            encoders: encoders.into_iter().flatten().collect(),
            previews: previews.into_iter().flatten().collect(),
        });
        match &info {
            Some(info) => log::info!(
                "SessionCoordinator: recording '{}' at {} fps ({:?}) into {}",
                info.session_id,
                config.frame_rate,
                config.trigger_mode(),
                config.output_dir.display()
            ),
            None => log::info!("SessionCoordinator: viewing {:?}", target),
        }
        Ok(info)
    }

    fn build_encoders(
        &self,
        config: &RecorderConfig,
        session_id: &str,
        handles: &[CameraHandle],
    ) -> Result<(Vec<Arc<AsyncVideoEncoder>>, RecordingInfo)> {
        std::fs::create_dir_all(&config.output_dir)
            .with_context(|| format!("creating {}", config.output_dir.display()))?;
        // One timestamp for every camera so the files of a take sort together.
        let mut timestamp = String::new();
        write!(timestamp, "{}", chrono::Local::now().format(&config.timestamp_format))
            .map_err(|_| anyhow!("invalid timestamp_format '{}'", config.timestamp_format))?;
        let mut encoders = Vec::with_capacity(handles.len());
        let mut files = Vec::with_capacity(handles.len());
        for handle in handles {
            let path = config.output_dir.join(format!(
                "{}_{}_{}.{}",
                session_id, timestamp, handle.name, config.encoder.video_extension
            ));
            let settings = EncoderSettings {
                name: handle.name.clone(),
                path: path.clone(),
                frame_rate: config.frame_rate as f64,
                codec: config.encoder.codec,
                quality: config.encoder.quality,
                write_timestamps: config.encoder.write_timestamps,
                queue_capacity: config.encoder.queue_capacity,
            };
            encoders.push(Arc::new(AsyncVideoEncoder::new(
                handle.slot,
                settings,
                self.backend.clone(),
                self.signals.clone(),
            )));
            files.push(path);
        }
        Ok((
            encoders,
            RecordingInfo {
                session_id: session_id.to_string(),
                timestamp,
                files,
            },
        ))
    }

    /// Ordered teardown. Idempotent; clears the sticky fault.
    pub fn stop(&self) -> Result<StopReport> {
        let mut inner = self.lock_inner();
        Ok(self.teardown(&mut inner, true))
    }

    fn teardown(&self, inner: &mut Inner, clear_fault: bool) -> StopReport {
        let mut report = StopReport::default();
        if let Some(mut run) = inner.run.take() {
            let state = self.state();
            report.stopped = Some(state);
            log::info!("SessionCoordinator: stopping ({})", state);
            if let Err(err) = run.acquisition.stop() {
                log::error!("SessionCoordinator: {:#}", err);
                report.errors.push(format!("{:#}", err));
            }
            for encoder in &run.encoders {
                if let DrainOutcome::Stalled { remaining } = encoder.wait_to_finish(self.drain) {
                    log::warn!(
                        "SessionCoordinator: encoder for {} stalled with {} frames queued",
                        encoder.settings().name,
                        remaining
                    );
                }
                if let Err(err) = encoder.stop() {
                    log::error!("SessionCoordinator: {:#}", err);
                    report.errors.push(format!("{:#}", err));
                }
                report.files.push(encoder.path().to_path_buf());
                report.frames_written.push(encoder.frames_written());
            }
            for queue in &run.previews {
                queue.clear();
            }
        }
        {
            let mut published = self.write_published();
            published.session_id = None;
            published.previews.clear();
            published.encoders.clear();
            published.stats = None;
        }
        report.fault = if clear_fault {
            self.signals.clear()
        } else {
            self.signals.fault()
        };
        self.set_state(SessionState::Idle);
        report
    }

    /// Current status. Tears a faulted run down on the way.
    pub fn poll_status(&self) -> SessionStatus {
        if self.state() != SessionState::Idle && self.signals.has_fault() {
            if let Ok(mut inner) = self.try_inner() {
                if inner.run.is_some() {
                    log::error!("SessionCoordinator: run failed, stopping automatically");
                    self.teardown(&mut inner, false);
                }
            }
        }
        self.status()
    }

    fn status(&self) -> SessionStatus {
        let published = self.read_published();
        let cameras = published
            .cameras
            .iter()
            .map(|cam| {
                let slot = cam.slot;
                let preview = published.previews.get(slot).and_then(Option::as_ref);
                let encoder = published.encoders.get(slot).and_then(Option::as_ref);
                CameraStatus {
                    slot,
                    name: cam.name.clone(),
                    frames: published.stats.as_ref().map_or(0, |s| s.frames(slot)),
                    preview_queue: preview.map(|q| q.len()),
                    encoder: encoder.map(|enc| EncoderStatus {
                        path: enc.path().to_path_buf(),
                        queue_len: enc.queue_len(),
                        queue_capacity: enc.queue_capacity(),
                        write_speed: enc.write_speed(),
                        frames_written: enc.frames_written(),
                        summary: enc.status_line(),
                    }),
                }
            })
            .collect();
        let fault = self.signals.fault();
        SessionStatus {
            state: self.state(),
            error: fault.is_some(),
            fault,
            session_id: published.session_id.clone(),
            cameras,
        }
    }

    /// Oldest frame waiting in a camera's preview queue. Never blocks.
    pub fn pop_preview(&self, slot: usize) -> Option<Frame> {
        let published = self.read_published();
        published.previews.get(slot)?.as_ref()?.pop_nowait()
    }

    /// Newest preview frame, discarding the older ones.
    pub fn latest_preview(&self, slot: usize) -> Option<Frame> {
        let queue = self.read_published().previews.get(slot)?.clone()?;
        let mut latest = None;
        while let Some(frame) = queue.pop_nowait() {
            latest = Some(frame);
        }
        latest
    }

    fn with_camera<R>(
        &self,
        slot: usize,
        f: impl FnOnce(&CameraHandle, &mut dyn CameraDevice) -> R,
    ) -> Result<R> {
        let inner = self.try_inner()?;
        self.require_idle()?;
        let rig = inner.rig.as_ref().ok_or(SessionError::NotConnected)?;
        let mut guard = lock_rig(rig)?;
        let (handle, device) = guard
            .camera_mut(slot)
            .ok_or(SessionError::NoSuchCamera(slot))?;
        Ok(f(handle, device))
    }

    pub fn set_gain_exposure(
        &self,
        slot: usize,
        gain: f64,
        exposure: f64,
    ) -> Result<Vec<ConfigurationError>> {
        self.with_camera(slot, |h, d| h.set_gain_exposure(d, gain, exposure))
    }

    pub fn set_color_mode(&self, slot: usize, mode: &str) -> Result<()> {
        self.with_camera(slot, |h, d| h.set_color_mode(d, mode))??;
        Ok(())
    }

    /// Toggle horizontal flip. Returns the new state.
    pub fn flip_x(&self, slot: usize) -> Result<bool> {
        Ok(self.with_camera(slot, |h, d| h.flip_x(d))??)
    }

    /// Toggle vertical flip. Returns the new state.
    pub fn flip_y(&self, slot: usize) -> Result<bool> {
        Ok(self.with_camera(slot, |h, d| h.flip_y(d))??)
    }

    pub fn set_color_balance(&self, slot: usize, ratios: [f64; 3]) -> Result<Vec<ConfigurationError>> {
        self.with_camera(slot, |h, d| h.set_color_balance(d, ratios))
    }

    pub fn camera_settings(&self, slot: usize) -> Result<CameraSettings> {
        self.with_camera(slot, |h, d| h.settings(d))
    }

    pub fn camera_limits(&self, slot: usize) -> Result<CameraLimits> {
        self.with_camera(slot, |h, _| h.limits())
    }

    /// Apply per-camera entries of a settings file, matched by camera name.
    pub fn apply_settings_file(&self, path: &Path) -> Result<Vec<(String, ConfigurationError)>> {
        let file = SettingsFile::load(path)?;
        let inner = self.try_inner()?;
        self.require_idle()?;
        let rig = inner.rig.as_ref().ok_or(SessionError::NotConnected)?;
        let mut guard = lock_rig(rig)?;
        Ok(apply_settings_file(&mut guard, &file))
    }

    /// Snapshot every camera plus the recording options into a settings file.
    pub fn save_settings_file(&self, path: &Path) -> Result<()> {
        let mut file = SettingsFile {
            hardware_trigger: Some(self.config.acquisition.hardware_trigger),
            crf: Some(self.config.encoder.quality),
            codec: Some(self.config.encoder.codec.to_string()),
            fps: Some(self.config.frame_rate),
            save_path: Some(self.config.output_dir.clone()),
            ..SettingsFile::default()
        };
        {
            let inner = self.try_inner()?;
            self.require_idle()?;
            let rig = inner.rig.as_ref().ok_or(SessionError::NotConnected)?;
            let mut guard = lock_rig(rig)?;
            for slot in 0..guard.len() {
                if let Some((handle, device)) = guard.camera_mut(slot) {
                    file.cameras.insert(handle.name.clone(), handle.settings(device));
                }
            }
        }
        file.save(path)?;
        log::info!(
            "SessionCoordinator: saved settings of {} cameras to {}",
            file.cameras.len(),
            path.display()
        );
        Ok(())
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        let mut inner = self.lock_inner();
        if inner.run.is_some() {
            self.teardown(&mut inner, true);
        }
    }
}

fn lock_rig(rig: &Mutex<CameraRig>) -> Result<MutexGuard<'_, CameraRig>, SessionError> {
    match rig.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(SessionError::Busy),
    }
}

fn lock_rig_blocking(rig: &Mutex<CameraRig>) -> MutexGuard<'_, CameraRig> {
    rig.lock().unwrap_or_else(PoisonError::into_inner)
}

fn apply_settings_file(rig: &mut CameraRig, file: &SettingsFile) -> Vec<(String, ConfigurationError)> {
    let mut rejected = Vec::new();
    for slot in 0..rig.len() {
        let Some((handle, device)) = rig.camera_mut(slot) else {
            continue;
        };
        match file.cameras.get(&handle.name) {
            Some(settings) => rejected.extend(
                handle
                    .apply_settings(device, settings)
                    .into_iter()
                    .map(|err| (handle.name.clone(), err)),
            ),
            None => log::info!("SessionCoordinator: no settings for {}", handle.name),
        }
    }
    let connected: Vec<&str> = rig.handles().iter().map(|h| h.name.as_str()).collect();
    for name in file.cameras.keys() {
        if !connected.contains(&name.as_str()) {
            log::info!("SessionCoordinator: settings for {} ignored, camera not connected", name);
        }
    }
    rejected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticDriver;
    use crate::encoder::testing::MemoryBackend;
    use std::time::Duration;

    fn coordinator(cameras: usize, dir: &Path) -> SessionCoordinator {
        let mut config = RecorderConfig {
            output_dir: dir.to_path_buf(),
            frame_rate: 100,
            ..RecorderConfig::default()
        };
        config.acquisition.grab_poll = Duration::from_millis(20);
        SessionCoordinator::new(
            config,
            Box::new(SyntheticDriver::uniform(cameras, 8, 4, false)),
            Arc::new(MemoryBackend::new()),
        )
        .with_drain_policy(DrainPolicy {
            poll: Duration::from_millis(5),
            ..DrainPolicy::default()
        })
    }

    fn session_error(err: &anyhow::Error) -> Option<&SessionError> {
        err.downcast_ref::<SessionError>()
    }

    #[test]
    fn session_ids_are_file_name_safe() {
        assert!(validate_session_id("mouse_07.day-2").is_ok());
        assert!(validate_session_id("_hidden").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn start_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(1, dir.path());
        let err = coord.start_viewing().unwrap_err();
        assert_eq!(session_error(&err), Some(&SessionError::NotConnected));
        let err = coord.start_recording("bad id").unwrap_err();
        assert!(matches!(
            session_error(&err),
            Some(SessionError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn configuration_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(2, dir.path());
        coord.connect().unwrap();
        assert!(coord.flip_x(0).unwrap());
        coord.start_viewing().unwrap();
        let err = coord.set_gain_exposure(0, 1.0, 1000.0).unwrap_err();
        assert_eq!(
            session_error(&err),
            Some(&SessionError::NotIdle(SessionState::Viewing))
        );
        coord.stop().unwrap();
        assert!(coord.set_gain_exposure(0, 1.0, 1000.0).unwrap().is_empty());
        assert!(coord.camera_settings(0).unwrap().flip_x);
    }

    #[test]
    fn single_view_only_fills_its_own_queue() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(2, dir.path());
        coord.connect().unwrap();
        let err = coord.start_single_view(5).unwrap_err();
        assert_eq!(session_error(&err), Some(&SessionError::NoSuchCamera(5)));
        coord.start_single_view(1).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(coord.latest_preview(1).is_some());
        assert!(coord.pop_preview(0).is_none());
        let status = coord.poll_status();
        assert_eq!(status.state, SessionState::Viewing);
        assert_eq!(status.cameras[0].preview_queue, None);
        coord.stop().unwrap();
    }

    #[test]
    fn settings_file_round_trip_through_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(2, dir.path());
        coord.connect().unwrap();
        coord.set_gain_exposure(1, 5.0, 3000.0).unwrap();
        let path = dir.path().join("rig.settings.json");
        coord.save_settings_file(&path).unwrap();

        coord.set_gain_exposure(1, 0.0, 100.0).unwrap();
        let rejected = coord.apply_settings_file(&path).unwrap();
        assert!(rejected.is_empty(), "{rejected:?}");
        let settings = coord.camera_settings(1).unwrap();
        assert_eq!(settings.gain, Some(5.0));
        assert_eq!(settings.exp_time, Some(3000.0));
    }
}
