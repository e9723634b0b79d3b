// ABOUTME: Progress and log reporting for a single-side pipeline run
// ABOUTME: Fixed milestones: started (0), calibrated (35), detections (60, 85), complete (100)

use irisscope_core::image::Side;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::prompts::StageId;

/// Progress milestones of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressStage {
    Started,
    Calibrated,
    /// First detection stage to finish, whichever it is
    FirstDetection,
    SecondDetection,
    Complete,
}

impl ProgressStage {
    pub fn percent(&self) -> u8 {
        match self {
            ProgressStage::Started => 0,
            ProgressStage::Calibrated => 35,
            ProgressStage::FirstDetection => 60,
            ProgressStage::SecondDetection => 85,
            ProgressStage::Complete => 100,
        }
    }
}

/// Receives `(stage label, percent)`
pub type ProgressCallback = Arc<dyn Fn(&str, u8) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Receives human-readable pipeline log entries
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Progress + log sink for one side.
///
/// Percentages only move forward: detection stages may finish in either
/// order, so the milestone is picked by how many have completed, not by
/// which one it was. Clones share state.
#[derive(Clone)]
pub struct PipelineReporter {
    side: Side,
    progress: ProgressCallback,
    log: LogCallback,
    detections_done: Arc<AtomicU8>,
    last_percent: Arc<AtomicU8>,
}

impl PipelineReporter {
    pub fn new(side: Side, progress: ProgressCallback, log: LogCallback) -> Self {
        Self {
            side,
            progress,
            log,
            detections_done: Arc::new(AtomicU8::new(0)),
            last_percent: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Reporter that only mirrors to `tracing`
    pub fn noop(side: Side) -> Self {
        Self::new(
            side,
            Arc::new(|_: &str, _: u8| {}),
            Arc::new(|_: LogLevel, _: &str| {}),
        )
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent.load(Ordering::SeqCst)
    }

    fn emit(&self, label: &str, stage: ProgressStage) {
        let percent = stage.percent();
        let previous = self.last_percent.fetch_max(percent, Ordering::SeqCst);
        if percent < previous {
            return;
        }
        tracing::debug!(
            target: "progress_notification",
            side = self.side.as_str(),
            stage = label,
            percent,
            "Pipeline progress"
        );
        (self.progress)(label, percent);
    }

    pub fn notify_started(&self) {
        self.emit("Starting analysis", ProgressStage::Started);
    }

    pub fn notify_calibrated(&self) {
        self.emit(
            StageId::Step1Geo.display_name(),
            ProgressStage::Calibrated,
        );
    }

    /// Idempotent per call count: the first finished detection reports 60, the second 85
    pub fn notify_detection_done(&self, stage: StageId) {
        let done = self.detections_done.fetch_add(1, Ordering::SeqCst) + 1;
        let milestone = if done <= 1 {
            ProgressStage::FirstDetection
        } else {
            ProgressStage::SecondDetection
        };
        self.emit(stage.display_name(), milestone);
    }

    pub fn notify_complete(&self) {
        self.emit("Aggregation", ProgressStage::Complete);
    }

    /// Send a log entry to the sink and mirror it to `tracing`
    pub fn log(&self, level: LogLevel, message: &str) {
        let side = self.side.as_str();
        match level {
            LogLevel::Info | LogLevel::Success => info!(side, level = level.as_str(), "{}", message),
            LogLevel::Warning => warn!(side, "{}", message),
            LogLevel::Error => error!(side, "{}", message),
        }
        (self.log)(level, message);
    }
}
