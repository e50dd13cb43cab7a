//! Multiplexed acquisition loop.
//!
//! One thread pulls frames from the camera rig, resolves the camera slot from
//! the frame context and fans each frame out to that camera's encoder (when
//! recording) and preview queue (when enabled).
//!
//! Phases: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//!
//! Fatal conditions (grab timeout, device failure, any queue overflow, a dead
//! encoder) raise a sticky fault on the session signals and end the loop.
//! Skipped frames and incomplete buffers are logged and tolerated.
//!
//! The rig stays locked by the loop thread for the whole run, so configuration
//! calls from other threads cannot reach the hardware while it is grabbing.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::camera::rig::{CameraRig, GrabTarget, RigGrab};
use crate::camera::GrabStrategy;
use crate::encoder::{AsyncVideoEncoder, FeedError};
use crate::fault::{Fault, FaultKind, QueueRole, SessionSignals};
use crate::frame::Frame;
use crate::queue::BoundedQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionPhase {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

#[derive(Debug)]
struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new() -> Self {
        Self(AtomicU8::new(AcquisitionPhase::Stopped as u8))
    }

    fn set(&self, phase: AcquisitionPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }

    fn get(&self) -> AcquisitionPhase {
        match self.0.load(Ordering::SeqCst) {
            1 => AcquisitionPhase::Starting,
            2 => AcquisitionPhase::Running,
            3 => AcquisitionPhase::Stopping,
            _ => AcquisitionPhase::Stopped,
        }
    }
}

/// Where frames of one camera slot go.
#[derive(Clone, Debug, Default)]
pub struct Route {
    pub encoder: Option<Arc<AsyncVideoEncoder>>,
    pub preview: Option<Arc<BoundedQueue<Frame>>>,
}

#[derive(Clone, Debug)]
pub struct AcquisitionPlan {
    pub target: GrabTarget,
    pub strategy: GrabStrategy,
    /// Silence after which the run is declared dead.
    pub grab_timeout: Duration,
    /// Longest single wait inside the driver; bounds cancellation latency.
    pub grab_poll: Duration,
    pub keep_timestamps: bool,
}

#[derive(Debug, Default)]
pub struct AcquisitionStats {
    frames: Vec<AtomicU64>,
    skipped: AtomicU64,
    incomplete: AtomicU64,
}

impl AcquisitionStats {
    fn new(slots: usize) -> Self {
        Self {
            frames: (0..slots).map(|_| AtomicU64::new(0)).collect(),
            ..Self::default()
        }
    }

    /// Frames routed for `slot` during the current run.
    pub fn frames(&self, slot: usize) -> u64 {
        self.frames
            .get(slot)
            .map(|n| n.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn incomplete(&self) -> u64 {
        self.incomplete.load(Ordering::Relaxed)
    }
}

/// Handle to a running acquisition thread.
#[derive(Debug)]
pub struct AcquisitionLoop {
    phase: Arc<PhaseCell>,
    stats: Arc<AcquisitionStats>,
    signals: Arc<SessionSignals>,
    join: Option<JoinHandle<()>>,
}

impl AcquisitionLoop {
    pub fn spawn(
        rig: Arc<Mutex<CameraRig>>,
        routes: Vec<Route>,
        plan: AcquisitionPlan,
        signals: Arc<SessionSignals>,
    ) -> Result<Self> {
        let phase = Arc::new(PhaseCell::new());
        let stats = Arc::new(AcquisitionStats::new(routes.len()));
        phase.set(AcquisitionPhase::Starting);
        let runner = Runner {
            routes,
            plan,
            signals: signals.clone(),
            phase: phase.clone(),
            stats: stats.clone(),
        };
        let join = std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || runner.run(&rig))
            .inspect_err(|_| phase.set(AcquisitionPhase::Stopped))
            .context("spawning acquisition thread")?;
        Ok(Self {
            phase,
            stats,
            signals,
            join: Some(join),
        })
    }

    pub fn phase(&self) -> AcquisitionPhase {
        self.phase.get()
    }

    pub fn stats(&self) -> &AcquisitionStats {
        &self.stats
    }

    pub fn shared_stats(&self) -> Arc<AcquisitionStats> {
        self.stats.clone()
    }

    /// The thread has exited on its own (fault) or after cancellation.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Cancel and join. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        self.signals.cancel();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow::anyhow!("acquisition thread panicked"))?;
        }
        self.phase.set(AcquisitionPhase::Stopped);
        Ok(())
    }
}

struct Runner {
    routes: Vec<Route>,
    plan: AcquisitionPlan,
    signals: Arc<SessionSignals>,
    phase: Arc<PhaseCell>,
    stats: Arc<AcquisitionStats>,
}

impl Runner {
    fn run(self, rig: &Mutex<CameraRig>) {
        let mut rig = rig.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = rig.start(self.plan.target, self.plan.strategy) {
            self.signals.raise(Fault::new(
                FaultKind::DeviceError,
                self.single_slot(),
                format!("cannot start grabbing: {:#}", err),
            ));
            self.phase.set(AcquisitionPhase::Stopped);
            return;
        }
        self.phase.set(AcquisitionPhase::Running);
        log::info!(
            "AcquisitionLoop: running ({:?}, {:?}, {} routes)",
            self.plan.target,
            self.plan.strategy,
            self.routes.len()
        );

        let mut last_frame = Instant::now();
        while !self.signals.is_cancelled() {
            let silent_for = last_frame.elapsed();
            if silent_for >= self.plan.grab_timeout {
                self.signals.raise(Fault::new(
                    FaultKind::GrabTimeout,
                    self.single_slot(),
                    format!("no frame for {} ms", silent_for.as_millis()),
                ));
                break;
            }
            let wait = self.plan.grab_poll.min(self.plan.grab_timeout - silent_for);
            match rig.grab(self.plan.target, wait, self.plan.keep_timestamps) {
                RigGrab::Frame { frame, skipped } => {
                    last_frame = Instant::now();
                    if skipped > 0 {
                        self.stats.skipped.fetch_add(skipped as u64, Ordering::Relaxed);
                        log::warn!(
                            "AcquisitionLoop: camera {} skipped {} frames before frame {}",
                            frame.camera,
                            skipped,
                            frame.camera_frame_id
                        );
                    }
                    if !self.route(frame) {
                        break;
                    }
                }
                RigGrab::Timeout => {}
                RigGrab::Incomplete { slot, reason } => {
                    last_frame = Instant::now();
                    self.stats.incomplete.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "AcquisitionLoop: grab failed on camera {}: {}",
                        slot.map_or_else(|| "?".to_string(), |s| s.to_string()),
                        reason
                    );
                }
                RigGrab::Failed(message) => {
                    self.signals.raise(Fault::new(
                        FaultKind::DeviceError,
                        self.single_slot(),
                        message,
                    ));
                    break;
                }
                RigGrab::UnknownContext(context) => {
                    log::warn!(
                        "AcquisitionLoop: dropping frame from unknown context {:#08x}",
                        context
                    );
                }
            }
        }

        self.phase.set(AcquisitionPhase::Stopping);
        rig.stop(self.plan.target);
        self.phase.set(AcquisitionPhase::Stopped);
        log::info!(
            "AcquisitionLoop: stopped ({} skipped, {} incomplete)",
            self.stats.skipped(),
            self.stats.incomplete()
        );
    }

    fn single_slot(&self) -> Option<usize> {
        match self.plan.target {
            GrabTarget::Single(slot) => Some(slot),
            GrabTarget::All => None,
        }
    }

    /// Fan `frame` out. Returns false when the run has to end.
    fn route(&self, frame: Frame) -> bool {
        let slot = frame.camera;
        let Some(route) = self.routes.get(slot) else {
            log::warn!("AcquisitionLoop: no route for camera {}", slot);
            return true;
        };
        if let Some(count) = self.stats.frames.get(slot) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(encoder) = &route.encoder {
            match encoder.feed(frame.clone()) {
                Ok(()) => {}
                Err(FeedError::Overflow) => {
                    self.signals.raise(Fault::new(
                        FaultKind::QueueOverflow {
                            role: QueueRole::Encode,
                        },
                        Some(slot),
                        format!(
                            "encoder queue full ({} frames) at frame {}",
                            encoder.queue_capacity(),
                            frame.sequence
                        ),
                    ));
                    return false;
                }
                Err(FeedError::Stopped) => {
                    self.signals.raise(Fault::new(
                        FaultKind::EncoderFailure,
                        Some(slot),
                        "encoder stopped while acquisition was running",
                    ));
                    return false;
                }
            }
        }
        if let Some(preview) = &route.preview {
            if preview.push(frame).is_err() {
                self.signals.raise(Fault::new(
                    FaultKind::QueueOverflow {
                        role: QueueRole::Preview,
                    },
                    Some(slot),
                    format!("preview queue full ({} frames)", preview.capacity()),
                ));
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::handle::AcquisitionSettings;
    use crate::camera::registry::CameraRegistry;
    use crate::camera::synthetic::{SyntheticCameraSpec, SyntheticDriver, SyntheticFault};
    use crate::camera::CameraDriver;

    fn rig(specs: Vec<SyntheticCameraSpec>) -> Arc<Mutex<CameraRig>> {
        let mut driver = SyntheticDriver::new(specs);
        let devices = driver.enumerate().unwrap();
        let mut rig = CameraRig::connect(&mut driver, &devices, &mut CameraRegistry::new()).unwrap();
        let settings = AcquisitionSettings {
            frame_rate: 200.0,
            ..AcquisitionSettings::default()
        };
        rig.configure(GrabTarget::All, &settings);
        Arc::new(Mutex::new(rig))
    }

    fn plan() -> AcquisitionPlan {
        AcquisitionPlan {
            target: GrabTarget::All,
            strategy: GrabStrategy::LatestImages,
            grab_timeout: Duration::from_millis(300),
            grab_poll: Duration::from_millis(20),
            keep_timestamps: true,
        }
    }

    fn preview_routes(n: usize, capacity: usize) -> Vec<Route> {
        (0..n)
            .map(|_| Route {
                encoder: None,
                preview: Some(Arc::new(BoundedQueue::new(capacity))),
            })
            .collect()
    }

    fn wait_finished(acq: &AcquisitionLoop) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !acq.is_finished() {
            assert!(Instant::now() < deadline, "acquisition did not stop");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn frames_reach_their_own_preview_queue_in_order() {
        let rig = rig(vec![
            SyntheticCameraSpec::new("a"),
            SyntheticCameraSpec::new("b"),
        ]);
        let routes = preview_routes(2, 1000);
        let signals = Arc::new(SessionSignals::new());
        let mut acq =
            AcquisitionLoop::spawn(rig.clone(), routes.clone(), plan(), signals.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        acq.stop().unwrap();
        assert_eq!(acq.phase(), AcquisitionPhase::Stopped);
        assert!(!signals.has_fault());

        for (slot, route) in routes.iter().enumerate() {
            let queue = route.preview.as_ref().unwrap();
            let mut last = None;
            let mut n = 0;
            while let Some(frame) = queue.pop_nowait() {
                assert_eq!(frame.camera, slot);
                if let Some(prev) = last {
                    assert!(frame.sequence > prev);
                }
                last = Some(frame.sequence);
                n += 1;
            }
            assert!(n > 0);
            assert_eq!(acq.stats().frames(slot), n);
        }
    }

    #[test]
    fn reported_skips_are_counted_but_not_fatal() {
        let rig = rig(vec![SyntheticCameraSpec {
            skip_every: Some(3),
            ..SyntheticCameraSpec::new("a")
        }]);
        let routes = preview_routes(1, 1000);
        let signals = Arc::new(SessionSignals::new());
        let mut acq =
            AcquisitionLoop::spawn(rig, routes.clone(), plan(), signals.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        acq.stop().unwrap();
        assert!(!signals.has_fault());
        assert!(acq.stats().skipped() > 0);

        let queue = routes[0].preview.as_ref().unwrap();
        let mut last = None;
        let mut n = 0;
        while let Some(frame) = queue.pop_nowait() {
            if let Some(prev) = last {
                assert!(frame.sequence > prev);
            }
            last = Some(frame.sequence);
            n += 1;
        }
        assert!(n >= 3);
        assert_eq!(acq.stats().frames(0), n);
    }

    #[test]
    fn silent_camera_becomes_grab_timeout() {
        let rig = rig(vec![SyntheticCameraSpec {
            frame_limit: Some(3),
            ..SyntheticCameraSpec::new("a")
        }]);
        let signals = Arc::new(SessionSignals::new());
        let mut acq =
            AcquisitionLoop::spawn(rig, preview_routes(1, 100), plan(), signals.clone()).unwrap();
        wait_finished(&acq);
        acq.stop().unwrap();
        assert_eq!(signals.fault().unwrap().kind, FaultKind::GrabTimeout);
    }

    #[test]
    fn preview_overflow_is_fatal() {
        let rig = rig(vec![SyntheticCameraSpec::new("a")]);
        let signals = Arc::new(SessionSignals::new());
        let mut acq =
            AcquisitionLoop::spawn(rig, preview_routes(1, 3), plan(), signals.clone()).unwrap();
        wait_finished(&acq);
        acq.stop().unwrap();
        let fault = signals.fault().unwrap();
        assert_eq!(
            fault.kind,
            FaultKind::QueueOverflow {
                role: QueueRole::Preview
            }
        );
        assert_eq!(fault.camera, Some(0));
    }

    #[test]
    fn device_failure_is_fatal_but_incomplete_is_not() {
        let rig = rig(vec![SyntheticCameraSpec {
            fault: Some(SyntheticFault::IncompleteAt(1)),
            frame_limit: Some(5),
            ..SyntheticCameraSpec::new("a")
        }]);
        let signals = Arc::new(SessionSignals::new());
        let mut acq =
            AcquisitionLoop::spawn(rig, preview_routes(1, 100), plan(), signals.clone()).unwrap();
        wait_finished(&acq);
        acq.stop().unwrap();
        // Ends on silence after the frame limit, not on the incomplete buffer.
        assert_eq!(signals.fault().unwrap().kind, FaultKind::GrabTimeout);
        assert_eq!(acq.stats().incomplete(), 1);
        assert_eq!(acq.stats().frames(0), 4);

        let rig = self::rig(vec![SyntheticCameraSpec {
            fault: Some(SyntheticFault::DeviceFailureAt(2)),
            ..SyntheticCameraSpec::new("a")
        }]);
        let signals = Arc::new(SessionSignals::new());
        let mut acq =
            AcquisitionLoop::spawn(rig, preview_routes(1, 100), plan(), signals.clone()).unwrap();
        wait_finished(&acq);
        acq.stop().unwrap();
        assert_eq!(signals.fault().unwrap().kind, FaultKind::DeviceError);
    }

    #[test]
    fn stop_is_prompt_and_repeatable() {
        let rig = rig(vec![SyntheticCameraSpec::new("a")]);
        let signals = Arc::new(SessionSignals::new());
        let mut acq =
            AcquisitionLoop::spawn(rig.clone(), vec![Route::default()], plan(), signals).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        acq.stop().unwrap();
        acq.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        // The rig is free again once the loop is gone.
        assert!(rig.try_lock().is_ok());
    }
}
