//! Screen capture and text extraction services.

use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::CaptureError;

/// Label used when the active window cannot be determined.
pub const UNKNOWN_SOURCE: &str = "Unknown";

/// Per-command limit unless [`CommandScreenSource::with_timeout`] says otherwise.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One captured frame.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: Vec<u8>,
    /// Active window title, or [`UNKNOWN_SOURCE`].
    pub source_label: String,
    pub captured_at: DateTime<Utc>,
}

/// Capture + OCR provider. Called from a blocking worker thread.
pub trait ScreenSource: Send + Sync {
    fn capture(&self) -> Result<Snapshot, CaptureError>;

    fn extract_text(&self, snapshot: &Snapshot) -> Result<String, CaptureError>;
}

/// Shells out to external programs.
///
/// - `capture` writes image bytes to stdout
/// - `ocr` reads image bytes on stdin and prints text
/// - `window_title` (optional) prints the active window title
///
/// A command still running after the timeout is killed.
#[derive(Debug, Clone)]
pub struct CommandScreenSource {
    capture: Vec<String>,
    ocr: Vec<String>,
    window_title: Option<Vec<String>>,
    timeout: Duration,
}

impl CommandScreenSource {
    pub fn new(
        capture: Vec<String>,
        ocr: Vec<String>,
        window_title: Option<Vec<String>>,
    ) -> Result<Self, CaptureError> {
        if capture.is_empty() {
            return Err(CaptureError::CaptureFailed("capture command is empty".into()));
        }
        if ocr.is_empty() {
            return Err(CaptureError::ExtractionFailed("ocr command is empty".into()));
        }
        Ok(Self {
            capture,
            ocr,
            window_title: window_title.filter(|argv| !argv.is_empty()),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn window_label(&self) -> String {
        let Some(argv) = &self.window_title else {
            return UNKNOWN_SOURCE.to_string();
        };
        match run(argv, None, self.timeout) {
            Ok(out) => {
                let title = String::from_utf8_lossy(&out).trim().to_string();
                if title.is_empty() {
                    UNKNOWN_SOURCE.to_string()
                } else {
                    title
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "window title command failed");
                UNKNOWN_SOURCE.to_string()
            }
        }
    }
}

impl ScreenSource for CommandScreenSource {
    fn capture(&self) -> Result<Snapshot, CaptureError> {
        let source_label = self.window_label();
        let data = run(&self.capture, None, self.timeout).map_err(CaptureError::CaptureFailed)?;
        if data.is_empty() {
            return Err(CaptureError::CaptureFailed("capture produced no output".into()));
        }
        Ok(Snapshot {
            data,
            source_label,
            captured_at: Utc::now(),
        })
    }

    fn extract_text(&self, snapshot: &Snapshot) -> Result<String, CaptureError> {
        let out = run(&self.ocr, Some(&snapshot.data), self.timeout)
            .map_err(CaptureError::ExtractionFailed)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn run(argv: &[String], stdin: Option<&[u8]>, timeout: Duration) -> Result<Vec<u8>, String> {
    let (program, args) = argv.split_first().ok_or_else(|| "empty command".to_string())?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("{program}: {e}"))?;

    // Feed stdin from a separate thread so a chatty child can't deadlock on stdout.
    let writer = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => {
            let bytes = bytes.to_vec();
            Some(std::thread::spawn(move || pipe.write_all(&bytes)))
        }
        _ => None,
    };

    // Pipes are drained on their own threads so a full pipe can't stall the child.
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match wait_until(&mut child, Instant::now() + timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("{program} timed out after {}ms", timeout.as_millis()));
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("{program}: {e}"));
        }
    };
    let stdout = stdout
        .join()
        .map_err(|_| format!("{program}: stdout reader panicked"))?;
    let stderr = stderr.join().unwrap_or_default();
    if let Some(handle) = writer {
        match handle.join() {
            Ok(Ok(())) => {}
            // Child may legitimately stop reading early.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(format!("{program}: writing stdin: {e}")),
            Err(_) => return Err(format!("{program}: stdin writer panicked")),
        }
    }

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr);
        return Err(format!("{program} exited with {status}: {}", stderr.trim()));
    }
    Ok(stdout)
}
