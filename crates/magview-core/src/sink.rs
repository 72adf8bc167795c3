//! Recording sinks for composited frames.

use crate::pipeline::PipelineError;
use image::RgbImage;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

/// Destination for a stream of equally sized RGB frames.
pub trait RecordingSink: Send {
    fn size(&self) -> (u32, u32);
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), PipelineError>;
    /// Flush and close. The sink is unusable afterwards.
    fn finish(self: Box<Self>) -> Result<(), PipelineError>;
}

/// Opens sinks for the compositor.
pub trait RecordingBackend: Send {
    fn open(&self, width: u32, height: u32, fps: u32)
        -> Result<Box<dyn RecordingSink>, PipelineError>;
}

/// Pipes raw RGB frames into an external `ffmpeg` encoder.
pub struct FfmpegBackend {
    program: PathBuf,
    output: PathBuf,
}

impl FfmpegBackend {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            output: output.into(),
        }
    }

    /// Use a specific encoder binary instead of `ffmpeg` from `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, width: u32, height: u32, fps: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(fps.max(1).to_string())
            .arg("-i")
            .arg("-")
            .arg(&self.output);
        cmd
    }
}

impl RecordingBackend for FfmpegBackend {
    fn open(
        &self,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn RecordingSink>, PipelineError> {
        Ok(Box::new(self.spawn(width, height, fps)?))
    }
}

impl FfmpegBackend {
    fn spawn(&self, width: u32, height: u32, fps: u32) -> Result<FfmpegSink, PipelineError> {
        let mut child = self
            .command(width, height, fps)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                PipelineError::SinkOpenFailed(format!(
                    "failed to spawn {}: {e}",
                    self.program.display()
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::SinkOpenFailed("encoder stdin unavailable".into()))?;

        tracing::info!(
            output = %self.output.display(),
            width,
            height,
            fps,
            "recording started"
        );
        Ok(FfmpegSink {
            child,
            stdin: Some(stdin),
            width,
            height,
        })
    }
}

struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl RecordingSink for FfmpegSink {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), PipelineError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(PipelineError::SinkWriteFailed(format!(
                "frame is {:?}, sink expects {}x{}",
                frame.dimensions(),
                self.width,
                self.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::SinkWriteFailed("encoder stdin closed".into()))?;
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))
    }

    fn finish(mut self: Box<Self>) -> Result<(), PipelineError> {
        // Closing stdin signals end of stream to the encoder.
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| PipelineError::SinkWriteFailed(format!("encoder wait failed: {e}")))?;
        if !status.success() {
            return Err(PipelineError::SinkWriteFailed(format!("encoder exited with {status}")));
        }
        tracing::info!("recording finished");
        Ok(())
    }
}

impl FfmpegSink {
    /// Close the encoder input of an unfinished recording and reap the
    /// encoder. Returns `None` once the sink was finished or abandoned.
    fn abandon(&mut self) -> Option<ExitStatus> {
        drop(self.stdin.take()?);
        match self.child.wait() {
            Ok(status) => {
                tracing::warn!(%status, "recording abandoned without finish");
                Some(status)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to reap abandoned encoder");
                None
            }
        }
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Keeps recorded frames in memory. Clones share the same frame list.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    frames: Arc<Mutex<Vec<RgbImage>>>,
    finished: Arc<Mutex<bool>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<RgbImage> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn finished(&self) -> bool {
        self.finished.lock().map(|f| *f).unwrap_or(false)
    }
}

impl RecordingBackend for MemoryBackend {
    fn open(
        &self,
        width: u32,
        height: u32,
        _fps: u32,
    ) -> Result<Box<dyn RecordingSink>, PipelineError> {
        Ok(Box::new(MemorySink {
            backend: self.clone(),
            width,
            height,
        }))
    }
}

struct MemorySink {
    backend: MemoryBackend,
    width: u32,
    height: u32,
}

impl RecordingSink for MemorySink {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), PipelineError> {
        self.backend
            .frames
            .lock()
            .map_err(|_| PipelineError::SinkWriteFailed("frame store poisoned".into()))?
            .push(frame.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), PipelineError> {
        if let Ok(mut finished) = self.backend.finished.lock() {
            *finished = true;
        }
        Ok(())
    }
}
