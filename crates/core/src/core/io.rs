//! Collaborator seams: rendering, feeder, video and persistence.
//!
//! The session core drives these through trait objects held in a
//! [`SessionContext`]. Calls are fire-and-forget from the core's point of
//! view; feeder and recorder failures come back as [`HardwareWarning`]s
//! that get logged, never propagated.

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::HardwareWarning;
use crate::log::EventRecord;
use crate::session::EndReason;
use crate::timer::Millis;
use crate::trial::{Payload, TrialKind};

/// What the touchscreen should show right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "screen", rename_all = "snake_case")]
pub enum Screen {
    /// "Place subject in box" prompt.
    AwaitingSubject { subject: String, phase: String },
    Iti { ms: Millis },
    Blank,
    Stimulus { trial: u32, payload: Payload },
    TerminalLink { trial: u32 },
    Reinforcement { auto: bool, hopper_ms: Millis },
    CorrectionTimeout { ms: Millis },
    SessionEnded { reason: EndReason },
}

pub trait Renderer {
    fn show(&mut self, screen: &Screen);
}

/// Food hopper (or any reinforcement actuator).
pub trait ReinforcementDevice {
    fn open(&mut self, duration_ms: Millis) -> Result<(), HardwareWarning>;
    fn close(&mut self) -> Result<(), HardwareWarning>;
}

/// File names returned by a recorder for one trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFiles {
    pub top: String,
    pub side: String,
}

pub trait VideoRecorder {
    fn start(&mut self, trial: u32, kind: TrialKind) -> Result<VideoFiles, HardwareWarning>;
    fn stop(&mut self, trial: u32) -> Result<(), HardwareWarning>;
}

pub trait LogSink {
    fn append(&mut self, records: &[EventRecord]) -> io::Result<()>;
}

/// Handles the controller talks to. No globals: a session owns its context.
pub struct SessionContext {
    pub renderer: Box<dyn Renderer + Send>,
    pub hopper: Box<dyn ReinforcementDevice + Send>,
    /// `None` when the box has no cameras.
    pub recorder: Option<Box<dyn VideoRecorder + Send>>,
    pub sink: Box<dyn LogSink + Send>,
}

impl SessionContext {
    pub fn new(
        renderer: impl Renderer + Send + 'static,
        hopper: impl ReinforcementDevice + Send + 'static,
        sink: impl LogSink + Send + 'static,
    ) -> Self {
        Self {
            renderer: Box::new(renderer),
            hopper: Box::new(hopper),
            recorder: None,
            sink: Box::new(sink),
        }
    }

    pub fn with_recorder(mut self, recorder: impl VideoRecorder + Send + 'static) -> Self {
        self.recorder = Some(Box::new(recorder));
        self
    }

    /// Everything discarded; handy for plan previews and benchmarks.
    pub fn null() -> Self {
        Self::new(NullRenderer, NullHopper, crate::log::NullSink)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn show(&mut self, _screen: &Screen) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullHopper;

impl ReinforcementDevice for NullHopper {
    fn open(&mut self, _duration_ms: Millis) -> Result<(), HardwareWarning> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), HardwareWarning> {
        Ok(())
    }
}

/// Keeps every screen it was shown; clones share the history.
#[derive(Debug, Clone, Default)]
pub struct RecordingRenderer {
    screens: std::sync::Arc<std::sync::Mutex<Vec<Screen>>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn screens(&self) -> Vec<Screen> {
        self.screens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<Screen> {
        self.screens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }
}

impl Renderer for RecordingRenderer {
    fn show(&mut self, screen: &Screen) {
        self.screens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(screen.clone());
    }
}
