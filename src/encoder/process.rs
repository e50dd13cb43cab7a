//! Sinks backed by files on disk.
//!
//! Compressed codecs pipe raw frames into an `ffmpeg` child process on stdin.
//! `Codec::Raw` writes the frames directly without spawning anything.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

use super::{Codec, EncoderBackend, EncoderSettings, FrameSink};
use crate::frame::{Frame, PixelFormat};

/// Bytes of encoder stderr kept for the exit error message.
const STDERR_TAIL: usize = 4096;

/// Opens ffmpeg (or raw) sinks.
#[derive(Clone, Debug)]
pub struct ProcessBackend {
    program: String,
}

impl ProcessBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl EncoderBackend for ProcessBackend {
    fn open(&self, settings: &EncoderSettings, first: &Frame) -> Result<Box<dyn FrameSink>> {
        if let Some(parent) = settings.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let geometry = Geometry::of(first);
        match settings.codec {
            Codec::Raw => Ok(Box::new(RawSink::create(settings, geometry)?)),
            _ => Ok(Box::new(FfmpegSink::spawn(&self.program, settings, geometry)?)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Geometry {
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Geometry {
    fn of(frame: &Frame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            format: frame.pixel_format,
        }
    }

    /// Every frame of one file must match the first one.
    fn check(&self, frame: &Frame) -> Result<()> {
        let got = Geometry::of(frame);
        if got != *self {
            return Err(anyhow!(
                "frame {} is {}x{} {}, stream was opened as {}x{} {}",
                frame.sequence,
                got.width,
                got.height,
                got.format,
                self.width,
                self.height,
                self.format
            ));
        }
        if frame.pixels().len() != frame.expected_len() {
            return Err(anyhow!(
                "frame {} carries {} bytes, expected {}",
                frame.sequence,
                frame.pixels().len(),
                frame.expected_len()
            ));
        }
        Ok(())
    }
}

/// ffmpeg arguments for raw frames of `geometry` arriving on stdin.
pub fn ffmpeg_args(settings: &EncoderSettings, width: u32, height: u32, format: PixelFormat) -> Vec<String> {
    let mut args: Vec<String> = [
        "-y",
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-f",
        "rawvideo",
        "-pix_fmt",
        format.ffmpeg_pix_fmt(),
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{width}x{height}"));
    args.push("-framerate".into());
    args.push(format!("{}", settings.frame_rate));
    args.extend(["-i", "-", "-vcodec", settings.codec.as_str()].map(String::from));
    args.extend(settings.codec.quality_args(settings.quality));
    args.push(settings.path.display().to_string());
    args
}

struct FfmpegSink {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<JoinHandle<String>>,
    geometry: Geometry,
    path: PathBuf,
}

impl FfmpegSink {
    fn spawn(program: &str, settings: &EncoderSettings, geometry: Geometry) -> Result<Self> {
        let args = ffmpeg_args(settings, geometry.width, geometry.height, geometry.format);
        log::debug!("VideoEncoder[{}]: {} {}", settings.name, program, args.join(" "));
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("{} has no stdin", program))?;
        // The child blocks once its stderr pipe is full, so it is read all along.
        let stderr = match child.stderr.take() {
            Some(pipe) => std::thread::Builder::new()
                .name(format!("encoder-stderr-{}", settings.name))
                .spawn(move || drain_stderr(pipe))
                .map(Some)
                .context("spawning encoder stderr reader"),
            None => Ok(None),
        };
        let stderr = match stderr {
            Ok(stderr) => stderr,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };
        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stderr,
            geometry,
            path: settings.path.clone(),
        })
    }
}

/// Read the pipe to its end, keeping the last `STDERR_TAIL` bytes.
fn drain_stderr(mut pipe: ChildStderr) -> String {
    let mut tail = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL {
                    tail.drain(..tail.len() - STDERR_TAIL);
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.geometry.check(frame)?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder input already closed"))?;
        stdin
            .write_all(frame.pixels())
            .context("writing frame to encoder process")
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let FfmpegSink {
            mut child,
            stdin,
            stderr,
            path,
            ..
        } = *self;
        // Closing stdin is what tells ffmpeg the stream ended.
        let flushed = match stdin {
            Some(mut stdin) => stdin.flush().context("flushing encoder input"),
            None => Ok(()),
        };
        let status = child.wait().context("waiting for encoder process")?;
        let stderr = stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(anyhow!(
                "encoder for {} exited with {}: {}",
                path.display(),
                status,
                stderr.trim()
            ));
        }
        flushed
    }
}

struct RawSink {
    file: BufWriter<File>,
    geometry: Geometry,
}

impl RawSink {
    fn create(settings: &EncoderSettings, geometry: Geometry) -> Result<Self> {
        let file = File::create(&settings.path)
            .with_context(|| format!("creating {}", settings.path.display()))?;
        Ok(Self {
            file: BufWriter::new(file),
            geometry,
        })
    }
}

impl FrameSink for RawSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.geometry.check(frame)?;
        self.file
            .write_all(frame.pixels())
            .context("writing raw frame")
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.file.flush().context("flushing raw video")?;
        self.file
            .get_ref()
            .sync_all()
            .context("syncing raw video")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_args_describe_raw_input() {
        let settings = EncoderSettings {
            frame_rate: 30.0,
            ..EncoderSettings::new("cam00", "/tmp/out/take_cam00.mp4")
        };
        let args = ffmpeg_args(&settings, 640, 480, PixelFormat::Bgr8);
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt bgr24 -s 640x480 -framerate 30 -i -"));
        assert!(joined.contains("-vcodec libx264 -crf 0"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out/take_cam00.mp4"));
    }

    #[test]
    fn raw_sink_writes_frames_back_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EncoderSettings {
            codec: Codec::Raw,
            ..EncoderSettings::new("cam00", dir.path().join("take.raw"))
        };
        let first = Frame::new(vec![1; 6], 3, 2, PixelFormat::Mono8, 0, 0);
        let backend = ProcessBackend::default();
        let mut sink = backend.open(&settings, &first).unwrap();
        sink.write_frame(&first).unwrap();
        sink.write_frame(&Frame::new(vec![2; 6], 3, 2, PixelFormat::Mono8, 0, 1))
            .unwrap();
        let wrong = Frame::new(vec![0; 4], 2, 2, PixelFormat::Mono8, 0, 2);
        assert!(sink.write_frame(&wrong).is_err());
        sink.finish().unwrap();
        let bytes = std::fs::read(dir.path().join("take.raw")).unwrap();
        assert_eq!(bytes, [1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2]);
    }

    /// Writes an executable shell script standing in for ffmpeg.
    #[cfg(unix)]
    fn fake_encoder(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    fn write_frames(backend: ProcessBackend, settings: EncoderSettings, frames: u64) -> Result<()> {
        let first = Frame::new(vec![0; 64 * 48], 64, 48, PixelFormat::Mono8, 0, 0);
        let mut sink = backend.open(&settings, &first)?;
        for seq in 0..frames {
            sink.write_frame(&Frame::new(vec![7; 64 * 48], 64, 48, PixelFormat::Mono8, 0, seq))?;
        }
        sink.finish()
    }

    #[cfg(unix)]
    #[test]
    fn chatty_encoder_does_not_stall_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_encoder(dir.path(), "head -c 300000 /dev/zero >&2\ncat >/dev/null");
        let settings = EncoderSettings::new("cam00", dir.path().join("take.mp4"));
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(write_frames(ProcessBackend::new(program), settings, 60));
        });
        let result = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("encoder sink blocked on a full stderr pipe");
        result.unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn failed_exit_reports_the_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_encoder(
            dir.path(),
            "head -c 10000 /dev/zero | tr '\\0' x >&2\necho 'unknown encoder libfoo' >&2\ncat >/dev/null\nexit 3",
        );
        let settings = EncoderSettings::new("cam00", dir.path().join("take.mp4"));
        let err = write_frames(ProcessBackend::new(program), settings, 3).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("unknown encoder libfoo"), "{message}");
        assert!(message.len() < STDERR_TAIL + 512, "{}", message.len());
    }

    #[test]
    fn missing_program_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EncoderSettings::new("cam00", dir.path().join("take.mp4"));
        let first = Frame::new(vec![0; 4], 2, 2, PixelFormat::Mono8, 0, 0);
        let backend = ProcessBackend::new("definitely-not-an-encoder-binary");
        assert!(backend.open(&settings, &first).is_err());
    }
}
