//! Asynchronous per-camera video encoder.
//!
//! `AsyncVideoEncoder` owns a bounded frame queue and one worker thread. The
//! acquisition loop calls `feed`, which never blocks; the worker pops frames in
//! order and writes them to a `FrameSink` produced by an `EncoderBackend`.
//!
//! Lifecycle: `Created -> Started -> Stopped`. The first `feed` starts the
//! worker, and the worker opens the sink once the first frame is available, so
//! cameras that never deliver a frame leave no file behind.
//!
//! On `stop`, the worker drains whatever is still queued before the sink is
//! finalized. A failing write records an `EncoderFailure` fault, discards the
//! rest of the queue and cancels the session.

pub mod process;

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::fault::{Fault, FaultKind, SessionSignals};
use crate::frame::{stamps_to_json, Frame, FrameStamp};
use crate::queue::{BoundedQueue, DEFAULT_ENCODE_CAPACITY};

pub use process::ProcessBackend;

/// Weight of the previous value in the write-speed moving average.
pub const SPEED_DECAY: f64 = 0.85;

const WORKER_IDLE: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    H264Nvenc,
    Libx264,
    Mpeg4,
    Mpeg2Video,
    Libxvid,
    Libx264Rgb,
    /// Raw frames written straight to disk, no external process.
    Raw,
}

impl Codec {
    pub const ALL: [Codec; 7] = [
        Codec::H264Nvenc,
        Codec::Libx264,
        Codec::Mpeg4,
        Codec::Mpeg2Video,
        Codec::Libxvid,
        Codec::Libx264Rgb,
        Codec::Raw,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Codec::H264Nvenc => "h264_nvenc",
            Codec::Libx264 => "libx264",
            Codec::Mpeg4 => "mpeg4",
            Codec::Mpeg2Video => "mpeg2video",
            Codec::Libxvid => "libxvid",
            Codec::Libx264Rgb => "libx264rgb",
            Codec::Raw => "rawvideo",
        }
    }

    /// Encoder options carrying the quality parameter.
    pub fn quality_args(self, quality: u32) -> Vec<String> {
        match self {
            Codec::Libx264 | Codec::Libx264Rgb => vec!["-crf".into(), quality.to_string()],
            Codec::H264Nvenc => vec!["-cq".into(), quality.to_string()],
            Codec::Mpeg4 | Codec::Mpeg2Video | Codec::Libxvid => {
                vec!["-q:v".into(), quality.clamp(1, 31).to_string()]
            }
            Codec::Raw => Vec::new(),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Codec::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted || (wanted == "raw" && *c == Codec::Raw))
            .ok_or_else(|| {
                let known: Vec<&str> = Codec::ALL.iter().map(|c| c.as_str()).collect();
                anyhow!("unknown codec '{}' (expected one of {})", s, known.join(", "))
            })
    }
}

#[derive(Clone, Debug)]
pub struct EncoderSettings {
    /// Camera name, used in log lines.
    pub name: String,
    pub path: PathBuf,
    pub frame_rate: f64,
    pub codec: Codec,
    pub quality: u32,
    pub write_timestamps: bool,
    pub queue_capacity: usize,
}

impl EncoderSettings {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            frame_rate: 10.0,
            codec: Codec::Libx264,
            quality: 0,
            write_timestamps: false,
            queue_capacity: DEFAULT_ENCODE_CAPACITY,
        }
    }

    /// `{base}.txt` next to the video file.
    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("txt")
    }
}

/// Creates sinks. One backend is shared by every encoder of a session.
pub trait EncoderBackend: Send + Sync {
    fn open(&self, settings: &EncoderSettings, first: &Frame) -> Result<Box<dyn FrameSink>>;
}

/// A destination accepting frames in order.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. An error here means the file may be incomplete.
    fn finish(self: Box<Self>) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedError {
    /// The encoder queue is full.
    Overflow,
    /// The encoder was stopped or its worker has failed.
    Stopped,
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedError::Overflow => f.write_str("encoder queue overflow"),
            FeedError::Stopped => f.write_str("encoder is stopped"),
        }
    }
}

impl std::error::Error for FeedError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderPhase {
    Created,
    Started,
    Stopped,
}

/// How `wait_to_finish` polls. Both bounds count consecutive polls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainPolicy {
    pub poll: Duration,
    /// Empty-queue polls after which the queue counts as drained.
    pub empty_polls: u32,
    /// Polls without a single frame written after which the worker counts as stalled.
    pub stall_polls: u32,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(100),
            empty_polls: 5,
            stall_polls: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// Worker already exited (stopped or failed).
    Finished,
    /// Frames are queued but none were written for `stall_polls` polls.
    Stalled { remaining: usize },
}

#[derive(Debug, Default)]
struct WorkerState {
    stopping: AtomicBool,
    failed: AtomicBool,
    finished: AtomicBool,
    opened: AtomicBool,
    frames_written: AtomicU64,
    /// Smoothed seconds per frame, as f64 bits. Zero until the first write.
    write_secs: AtomicU64,
    stamps: Mutex<Vec<FrameStamp>>,
}

impl WorkerState {
    fn write_secs(&self) -> Option<f64> {
        let secs = f64::from_bits(self.write_secs.load(Ordering::Relaxed));
        (secs > 0.0).then_some(secs)
    }

    fn record_write(&self, elapsed: Duration) {
        let instant = elapsed.as_secs_f64().max(f64::EPSILON);
        let next = match self.write_secs() {
            Some(prev) => SPEED_DECAY * prev + (1.0 - SPEED_DECAY) * instant,
            None => instant,
        };
        self.write_secs.store(next.to_bits(), Ordering::Relaxed);
        self.frames_written.fetch_add(1, Ordering::SeqCst);
    }
}

struct Control {
    phase: EncoderPhase,
    worker: Option<JoinHandle<()>>,
}

pub struct AsyncVideoEncoder {
    camera: usize,
    settings: EncoderSettings,
    backend: Arc<dyn EncoderBackend>,
    signals: Arc<SessionSignals>,
    queue: Arc<BoundedQueue<Frame>>,
    state: Arc<WorkerState>,
    control: Mutex<Control>,
    overflows: AtomicU64,
}

impl AsyncVideoEncoder {
    pub fn new(
        camera: usize,
        settings: EncoderSettings,
        backend: Arc<dyn EncoderBackend>,
        signals: Arc<SessionSignals>,
    ) -> Self {
        let queue = Arc::new(BoundedQueue::new(settings.queue_capacity));
        Self {
            camera,
            settings,
            backend,
            signals,
            queue,
            state: Arc::new(WorkerState::default()),
            control: Mutex::new(Control {
                phase: EncoderPhase::Created,
                worker: None,
            }),
            overflows: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings.path
    }

    pub fn camera(&self) -> usize {
        self.camera
    }

    pub fn phase(&self) -> EncoderPhase {
        self.lock_control().phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase() == EncoderPhase::Stopped
    }

    pub fn has_failed(&self) -> bool {
        self.state.failed.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn frames_written(&self) -> u64 {
        self.state.frames_written.load(Ordering::SeqCst)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::SeqCst)
    }

    /// Smoothed write throughput in frames per second.
    pub fn write_speed(&self) -> Option<f64> {
        self.state.write_secs().map(|secs| 1.0 / secs)
    }

    /// `Queue n/cap; Write speed x FPS`
    pub fn status_line(&self) -> String {
        let speed = match self.write_speed() {
            Some(fps) => format!("{fps:.1}"),
            None => "nan".to_string(),
        };
        format!(
            "Queue {}/{}; Write speed {} FPS",
            self.queue_len(),
            self.queue_capacity(),
            speed
        )
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame for writing. Never blocks on the encoder.
    pub fn feed(&self, frame: Frame) -> Result<(), FeedError> {
        {
            let mut control = self.lock_control();
            match control.phase {
                EncoderPhase::Stopped => return Err(FeedError::Stopped),
                EncoderPhase::Created => {
                    let worker = self.spawn_worker().map_err(|err| {
                        self.signals.raise(Fault::new(
                            FaultKind::EncoderFailure,
                            Some(self.camera),
                            format!("{:#}", err),
                        ));
                        FeedError::Stopped
                    })?;
                    control.worker = Some(worker);
                    control.phase = EncoderPhase::Started;
                }
                EncoderPhase::Started => {}
            }
        }
        if self.has_failed() {
            return Err(FeedError::Stopped);
        }
        self.queue.push(frame).map_err(|_| {
            self.overflows.fetch_add(1, Ordering::SeqCst);
            FeedError::Overflow
        })
    }

    fn spawn_worker(&self) -> Result<JoinHandle<()>> {
        let worker = Worker {
            camera: self.camera,
            settings: self.settings.clone(),
            backend: self.backend.clone(),
            signals: self.signals.clone(),
            queue: self.queue.clone(),
            state: self.state.clone(),
        };
        std::thread::Builder::new()
            .name(format!("encoder-{}", self.settings.name))
            .spawn(move || worker.run())
            .context("spawning encoder worker")
    }

    /// Wait until the queue drains, the worker exits, or the worker stalls.
    pub fn wait_to_finish(&self, policy: DrainPolicy) -> DrainOutcome {
        let mut empty = 0;
        let mut idle = 0;
        let mut last_written = self.frames_written();
        loop {
            if self.state.finished.load(Ordering::SeqCst) || self.phase() != EncoderPhase::Started
            {
                return DrainOutcome::Finished;
            }
            let remaining = self.queue.len();
            if remaining == 0 {
                empty += 1;
                if empty >= policy.empty_polls {
                    return DrainOutcome::Drained;
                }
            } else {
                empty = 0;
            }
            let written = self.frames_written();
            if written == last_written && remaining > 0 {
                idle += 1;
                if idle >= policy.stall_polls {
                    log::warn!(
                        "VideoEncoder[{}]: no progress with {} frames queued",
                        self.settings.name,
                        remaining
                    );
                    return DrainOutcome::Stalled { remaining };
                }
            } else {
                idle = 0;
                last_written = written;
            }
            std::thread::sleep(policy.poll);
        }
    }

    /// Drain, join the worker, finalize the sink and write the timestamp sidecar.
    ///
    /// Idempotent: a second call is a no-op.
    pub fn stop(&self) -> Result<()> {
        let worker = {
            let mut control = self.lock_control();
            if control.phase == EncoderPhase::Stopped {
                return Ok(());
            }
            control.phase = EncoderPhase::Stopped;
            control.worker.take()
        };
        self.state.stopping.store(true, Ordering::SeqCst);
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| anyhow!("encoder worker for {} panicked", self.settings.name))?;
        }
        log::info!(
            "VideoEncoder[{}]: stopped after {} frames",
            self.settings.name,
            self.frames_written()
        );
        if self.settings.write_timestamps && self.state.opened.load(Ordering::SeqCst) {
            self.write_sidecar()?;
        }
        Ok(())
    }

    fn write_sidecar(&self) -> Result<()> {
        let stamps = self
            .state
            .stamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let path = self.settings.sidecar_path();
        let raw = stamps_to_json(&stamps)?;
        std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
        log::debug!(
            "VideoEncoder[{}]: wrote {} timestamps to {}",
            self.settings.name,
            stamps.len(),
            path.display()
        );
        Ok(())
    }
}

impl fmt::Debug for AsyncVideoEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncVideoEncoder")
            .field("camera", &self.camera)
            .field("path", &self.settings.path)
            .field("phase", &self.phase())
            .field("frames_written", &self.frames_written())
            .finish()
    }
}

struct Worker {
    camera: usize,
    settings: EncoderSettings,
    backend: Arc<dyn EncoderBackend>,
    signals: Arc<SessionSignals>,
    queue: Arc<BoundedQueue<Frame>>,
    state: Arc<WorkerState>,
}

impl Worker {
    fn run(self) {
        let mut sink: Option<Box<dyn FrameSink>> = None;
        loop {
            if sink.is_none() {
                // Open against the oldest frame without taking it off the queue.
                // The clone shares pixels and keeps the queue unlocked while opening.
                let opened = self
                    .queue
                    .peek(Frame::clone)
                    .map(|first| self.backend.open(&self.settings, &first));
                match opened {
                    Some(Ok(s)) => {
                        log::info!(
                            "VideoEncoder[{}]: opened {} ({})",
                            self.settings.name,
                            self.settings.path.display(),
                            self.settings.codec
                        );
                        self.state.opened.store(true, Ordering::SeqCst);
                        sink = Some(s);
                    }
                    Some(Err(err)) => {
                        self.fail(format!("cannot open encoder: {:#}", err));
                        break;
                    }
                    None => {
                        if self.state.stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        std::thread::sleep(WORKER_IDLE);
                        continue;
                    }
                }
            }
            let Some(active) = sink.as_mut() else {
                continue;
            };
            match self.queue.pop_nowait() {
                Some(frame) => {
                    let started = Instant::now();
                    if let Err(err) = active.write_frame(&frame) {
                        self.fail(format!("write failed at frame {}: {:#}", frame.sequence, err));
                        break;
                    }
                    self.state.record_write(started.elapsed());
                    if self.settings.write_timestamps {
                        self.state
                            .stamps
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(frame.stamp());
                    }
                }
                None => {
                    if self.state.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(WORKER_IDLE);
                }
            }
        }
        if let Some(sink) = sink {
            match sink.finish() {
                Ok(()) => log::debug!("VideoEncoder[{}]: finalized", self.settings.name),
                Err(err) => {
                    if !self.state.failed.load(Ordering::SeqCst) {
                        self.fail(format!("finalize failed: {:#}", err));
                    } else {
                        log::warn!("VideoEncoder[{}]: finalize failed: {:#}", self.settings.name, err);
                    }
                }
            }
        }
        self.state.finished.store(true, Ordering::SeqCst);
    }

    fn fail(&self, message: String) {
        self.state.failed.store(true, Ordering::SeqCst);
        let dropped = self.queue.clear();
        log::error!(
            "VideoEncoder[{}]: {} ({} queued frames discarded)",
            self.settings.name,
            message,
            dropped
        );
        self.signals.raise(Fault::new(
            FaultKind::EncoderFailure,
            Some(self.camera),
            message,
        ));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory backend doubles.

    use super::*;
    use std::sync::mpsc::{Receiver, Sender};

    #[derive(Debug, Default)]
    pub struct Recorded {
        pub opened: Vec<PathBuf>,
        pub frames: Vec<(usize, u64)>,
        pub finished: usize,
    }

    /// Records what it is asked to write. Optional gate holds `open` until released,
    /// optional failure point makes the n-th write fail.
    pub struct MemoryBackend {
        pub recorded: Arc<Mutex<Recorded>>,
        gate: Option<Mutex<Receiver<()>>>,
        fail_at: Option<usize>,
    }

    impl MemoryBackend {
        pub fn new() -> Self {
            Self {
                recorded: Arc::default(),
                gate: None,
                fail_at: None,
            }
        }

        pub fn gated() -> (Self, Sender<()>) {
            let (tx, rx) = std::sync::mpsc::channel();
            let backend = Self {
                gate: Some(Mutex::new(rx)),
                ..Self::new()
            };
            (backend, tx)
        }

        pub fn failing_at(n: usize) -> Self {
            Self {
                fail_at: Some(n),
                ..Self::new()
            }
        }
    }

    impl EncoderBackend for MemoryBackend {
        fn open(&self, settings: &EncoderSettings, _first: &Frame) -> Result<Box<dyn FrameSink>> {
            if let Some(gate) = &self.gate {
                // Released by a send or by dropping the sender.
                let _ = gate.lock().unwrap().recv();
            }
            self.recorded.lock().unwrap().opened.push(settings.path.clone());
            Ok(Box::new(MemorySink {
                recorded: self.recorded.clone(),
                fail_at: self.fail_at,
                written: 0,
            }))
        }
    }

    struct MemorySink {
        recorded: Arc<Mutex<Recorded>>,
        fail_at: Option<usize>,
        written: usize,
    }

    impl FrameSink for MemorySink {
        fn write_frame(&mut self, frame: &Frame) -> Result<()> {
            if self.fail_at == Some(self.written) {
                return Err(anyhow!("codec rejected frame"));
            }
            self.written += 1;
            self.recorded
                .lock()
                .unwrap()
                .frames
                .push((frame.camera, frame.sequence));
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            self.recorded.lock().unwrap().finished += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryBackend;
    use super::*;
    use crate::frame::{stamps_from_json, PixelFormat};

    fn frame(sequence: u64) -> Frame {
        let mut f = Frame::new(vec![0; 4], 2, 2, PixelFormat::Mono8, 0, sequence);
        f.device_timestamp = Some(1000 + sequence);
        f
    }

    fn encoder(
        backend: MemoryBackend,
        capacity: usize,
        dir: &Path,
    ) -> (AsyncVideoEncoder, Arc<SessionSignals>) {
        let signals = Arc::new(SessionSignals::new());
        let settings = EncoderSettings {
            queue_capacity: capacity,
            write_timestamps: true,
            ..EncoderSettings::new("cam00", dir.join("take_cam00.mp4"))
        };
        let encoder = AsyncVideoEncoder::new(0, settings, Arc::new(backend), signals.clone());
        (encoder, signals)
    }

    #[test]
    fn codec_names_parse() {
        assert_eq!("libx264".parse::<Codec>().unwrap(), Codec::Libx264);
        assert_eq!("RAW".parse::<Codec>().unwrap(), Codec::Raw);
        assert!("vp9".parse::<Codec>().is_err());
        assert_eq!(Codec::Mpeg4.quality_args(0), vec!["-q:v", "1"]);
    }

    #[test]
    fn stop_drains_every_queued_frame_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, gate) = MemoryBackend::gated();
        let recorded = backend.recorded.clone();
        let (encoder, signals) = encoder(backend, 64, dir.path());
        for seq in 0..40 {
            encoder.feed(frame(seq)).unwrap();
        }
        assert_eq!(encoder.phase(), EncoderPhase::Started);
        drop(gate);
        encoder.stop().unwrap();

        let recorded = recorded.lock().unwrap();
        let seqs: Vec<u64> = recorded.frames.iter().map(|(_, s)| *s).collect();
        assert_eq!(seqs, (0..40).collect::<Vec<_>>());
        assert_eq!(recorded.finished, 1);
        assert!(encoder.is_stopped());
        assert!(!signals.has_fault());

        let sidecar = std::fs::read_to_string(dir.path().join("take_cam00.txt")).unwrap();
        let stamps = stamps_from_json(&sidecar).unwrap();
        assert_eq!(stamps.len(), 40);
        assert_eq!(stamps[3].device_timestamp, Some(1003));
    }

    #[test]
    fn sixth_feed_overflows_capacity_five() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, gate) = MemoryBackend::gated();
        let (encoder, _signals) = encoder(backend, 5, dir.path());
        let results: Vec<_> = (0..6).map(|seq| encoder.feed(frame(seq))).collect();
        assert!(results[..5].iter().all(Result::is_ok));
        assert_eq!(results[5], Err(FeedError::Overflow));
        assert_eq!(encoder.overflow_count(), 1);
        drop(gate);
        encoder.stop().unwrap();
        assert_eq!(encoder.frames_written(), 5);
    }

    #[test]
    fn write_failure_raises_fault_and_rejects_feeds() {
        let dir = tempfile::tempdir().unwrap();
        let (encoder, signals) = encoder(MemoryBackend::failing_at(2), 16, dir.path());
        for seq in 0..3 {
            encoder.feed(frame(seq)).unwrap();
        }
        let outcome = encoder.wait_to_finish(DrainPolicy {
            poll: Duration::from_millis(10),
            ..DrainPolicy::default()
        });
        assert_eq!(outcome, DrainOutcome::Finished);
        assert!(encoder.has_failed());
        assert_eq!(signals.fault().unwrap().kind, FaultKind::EncoderFailure);
        assert_eq!(encoder.feed(frame(9)), Err(FeedError::Stopped));
        encoder.stop().unwrap();
        assert_eq!(encoder.frames_written(), 2);
    }

    #[test]
    fn unfed_encoder_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let recorded = backend.recorded.clone();
        let (encoder, _) = encoder(backend, 4, dir.path());
        assert_eq!(encoder.status_line(), "Queue 0/4; Write speed nan FPS");
        encoder.stop().unwrap();
        encoder.stop().unwrap();
        assert!(recorded.lock().unwrap().opened.is_empty());
        assert!(!dir.path().join("take_cam00.txt").exists());
        assert_eq!(encoder.feed(frame(0)), Err(FeedError::Stopped));
    }

    #[test]
    fn wait_to_finish_reports_stall() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, gate) = MemoryBackend::gated();
        let (encoder, _) = encoder(backend, 8, dir.path());
        encoder.feed(frame(0)).unwrap();
        let outcome = encoder.wait_to_finish(DrainPolicy {
            poll: Duration::from_millis(5),
            empty_polls: 5,
            stall_polls: 4,
        });
        assert_eq!(outcome, DrainOutcome::Stalled { remaining: 1 });
        drop(gate);
        encoder.stop().unwrap();
        assert_eq!(encoder.frames_written(), 1);
    }
}
