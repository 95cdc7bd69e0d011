//! Periodic screen activity sampling during study phases.
//!
//! On every cadence tick the sampler captures a snapshot, extracts its
//! text, normalizes it, and keeps it only if its comprehensibility score is
//! strictly above the configured threshold. Capture runs on a blocking
//! worker under a timeout; the countdown never waits on it.
//!
//! ## Stop guarantee
//!
//! Each `start` gets a fresh shared buffer with an `accepting` flag. `stop`
//! clears the flag and takes the buffer under the same lock before
//! cancelling the loop, so a capture that finishes late is dropped instead
//! of landing in the returned buffer or the next phase's buffer.

mod lexicon;
mod source;
mod summary;
mod text;

pub use lexicon::Lexicon;
pub use source::{CommandScreenSource, ScreenSource, Snapshot, UNKNOWN_SOURCE};
pub use summary::{excerpt, ActivitySummary, Highlight, SourceFocus};
pub use text::{comprehensibility, normalize};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::CaptureError;

/// Sampler settings, stored under `[sampler]` in config.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between captures, 5..=30.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Entries must score strictly above this to be kept.
    #[serde(default = "default_threshold")]
    pub comprehensibility_threshold: f64,
    /// Consecutive failures before the sampler gives up for the phase.
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,
    /// Newline-separated words added to the built-in lexicon.
    #[serde(default)]
    pub lexicon_path: Option<String>,
    #[serde(default)]
    pub capture_command: Option<Vec<String>>,
    #[serde(default)]
    pub ocr_command: Option<Vec<String>>,
    #[serde(default)]
    pub window_title_command: Option<Vec<String>>,
}

fn default_enabled() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    30
}
fn default_threshold() -> f64 {
    0.5
}
fn default_failure_limit() -> u32 {
    3
}
fn default_capture_timeout_secs() -> u64 {
    10
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            comprehensibility_threshold: default_threshold(),
            failure_limit: default_failure_limit(),
            capture_timeout_secs: default_capture_timeout_secs(),
            lexicon_path: None,
            capture_command: None,
            ocr_command: None,
            window_title_command: None,
        }
    }
}

impl SamplerConfig {
    /// Configured screen source, if capture and OCR commands are both set.
    pub fn screen_source(&self) -> Option<Result<CommandScreenSource, CaptureError>> {
        match (&self.capture_command, &self.ocr_command) {
            (Some(capture), Some(ocr)) => Some(
                CommandScreenSource::new(
                    capture.clone(),
                    ocr.clone(),
                    self.window_title_command.clone(),
                )
                .map(|source| {
                    source.with_timeout(Duration::from_secs(self.capture_timeout_secs))
                }),
            ),
            _ => None,
        }
    }

    /// Built-in lexicon, extended from `lexicon_path` when set.
    pub fn lexicon(&self) -> std::io::Result<Lexicon> {
        match &self.lexicon_path {
            Some(path) => Lexicon::with_file(Path::new(path)),
            None => Ok(Lexicon::builtin()),
        }
    }
}

/// Timing and filter knobs for one sampler instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    pub interval: Duration,
    pub threshold: f64,
    pub failure_limit: u32,
    pub capture_timeout: Duration,
}

impl From<&SamplerConfig> for SamplerSettings {
    fn from(cfg: &SamplerConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs),
            threshold: cfg.comprehensibility_threshold,
            failure_limit: cfg.failure_limit.max(1),
            capture_timeout: Duration::from_secs(cfg.capture_timeout_secs),
        }
    }
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self::from(&SamplerConfig::default())
    }
}

/// One kept capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub source_label: String,
    pub extracted_text: String,
    pub is_comprehensible: bool,
    pub score: f64,
}

/// Everything sampled during one study interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityBuffer {
    /// Comprehensible entries only.
    pub entries: Vec<ActivityEntry>,
    pub discarded: u64,
    pub failures: u64,
    pub degraded: bool,
    pub interval_secs: u64,
}

impl ActivityBuffer {
    fn new(interval: Duration) -> Self {
        Self {
            interval_secs: interval.as_secs(),
            ..Self::default()
        }
    }

    /// Append `other` (a later run within the same interval).
    pub fn merge(&mut self, other: ActivityBuffer) {
        self.entries.extend(other.entries);
        self.discarded += other.discarded;
        self.failures += other.failures;
        self.degraded |= other.degraded;
        if self.interval_secs == 0 {
            self.interval_secs = other.interval_secs;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.discarded == 0 && self.failures == 0
    }
}

/// Start/stop seam the scheduler drives once per study interval.
pub trait ActivityMonitor: Send {
    /// Begin sampling into a fresh buffer. No-op if already running.
    fn start(&mut self);

    /// Stop sampling and hand back the buffer. Nothing is appended to it
    /// after this returns.
    fn stop(&mut self) -> ActivityBuffer;

    /// Drain pending warnings (e.g. degradation).
    fn take_warnings(&mut self) -> Vec<String>;

    fn is_running(&self) -> bool;
}

/// Monitor used when sampling is disabled.
#[derive(Debug, Default)]
pub struct NullMonitor {
    running: bool,
}

impl ActivityMonitor for NullMonitor {
    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) -> ActivityBuffer {
        self.running = false;
        ActivityBuffer::default()
    }

    fn take_warnings(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

struct Shared {
    accepting: bool,
    buffer: ActivityBuffer,
    consecutive_failures: u32,
    warnings: Vec<String>,
}

struct Running {
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tokio-backed sampler over a [`ScreenSource`].
pub struct ActivitySampler {
    runtime: Handle,
    source: Arc<dyn ScreenSource>,
    lexicon: Arc<Lexicon>,
    settings: SamplerSettings,
    running: Option<Running>,
    warnings: Vec<String>,
}

impl ActivitySampler {
    pub fn new(
        runtime: Handle,
        source: Arc<dyn ScreenSource>,
        lexicon: Lexicon,
        settings: SamplerSettings,
    ) -> Self {
        Self {
            runtime,
            source,
            lexicon: Arc::new(lexicon),
            settings,
            running: None,
            warnings: Vec::new(),
        }
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // A panic while holding the lock leaves plain data behind; keep going.
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ActivityMonitor for ActivitySampler {
    fn start(&mut self) {
        if self.running.is_some() {
            tracing::debug!("sampler already running");
            return;
        }
        let shared = Arc::new(Mutex::new(Shared {
            accepting: true,
            buffer: ActivityBuffer::new(self.settings.interval),
            consecutive_failures: 0,
            warnings: Vec::new(),
        }));
        let cancel = CancellationToken::new();
        let handle = self.runtime.spawn(sampling_loop(
            Arc::clone(&shared),
            Arc::clone(&self.source),
            Arc::clone(&self.lexicon),
            self.settings,
            cancel.clone(),
        ));
        tracing::debug!(interval_ms = self.settings.interval.as_millis() as u64, "sampler started");
        self.running = Some(Running {
            shared,
            cancel,
            handle,
        });
    }

    fn stop(&mut self) -> ActivityBuffer {
        let Some(running) = self.running.take() else {
            return ActivityBuffer::default();
        };
        let buffer = {
            let mut state = lock(&running.shared);
            state.accepting = false;
            self.warnings.append(&mut state.warnings);
            std::mem::take(&mut state.buffer)
        };
        running.cancel.cancel();
        running.handle.abort();
        tracing::debug!(
            kept = buffer.entries.len(),
            discarded = buffer.discarded,
            failures = buffer.failures,
            "sampler stopped"
        );
        buffer
    }

    fn take_warnings(&mut self) -> Vec<String> {
        let mut out = std::mem::take(&mut self.warnings);
        if let Some(running) = &self.running {
            out.append(&mut lock(&running.shared).warnings);
        }
        out
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for ActivitySampler {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            lock(&running.shared).accepting = false;
            running.cancel.cancel();
            running.handle.abort();
        }
    }
}

async fn sampling_loop(
    shared: Arc<Mutex<Shared>>,
    source: Arc<dyn ScreenSource>,
    lexicon: Arc<Lexicon>,
    settings: SamplerSettings,
    cancel: CancellationToken,
) {
    let period = settings.interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = capture_once(Arc::clone(&source), settings.capture_timeout) => r,
        };

        let mut state = lock(&shared);
        if !state.accepting {
            break;
        }
        match result {
            Ok((label, raw)) => {
                state.consecutive_failures = 0;
                let text = normalize(&raw);
                let score = comprehensibility(&text, &lexicon);
                if score > settings.threshold {
                    state.buffer.entries.push(ActivityEntry {
                        timestamp: Utc::now(),
                        source_label: label,
                        extracted_text: text,
                        is_comprehensible: true,
                        score,
                    });
                } else {
                    state.buffer.discarded += 1;
                }
            }
            Err(e) => {
                state.buffer.failures += 1;
                state.consecutive_failures += 1;
                let consecutive = state.consecutive_failures;
                tracing::warn!(error = %e, consecutive, "activity capture failed");
                if consecutive >= settings.failure_limit {
                    state.buffer.degraded = true;
                    state.warnings.push(format!(
                        "screen sampling disabled for this phase after {consecutive} consecutive failures: {e}"
                    ));
                    break;
                }
            }
        }
    }
}

async fn capture_once(
    source: Arc<dyn ScreenSource>,
    timeout: Duration,
) -> Result<(String, String), CaptureError> {
    let job = tokio::task::spawn_blocking(move || {
        let snapshot = source.capture()?;
        let text = source.extract_text(&snapshot)?;
        Ok::<_, CaptureError>((snapshot.source_label, text))
    });
    match tokio::time::timeout(timeout, job).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(CaptureError::Worker(join.to_string())),
        Err(_) => Err(CaptureError::Timeout(timeout.as_secs())),
    }
}
