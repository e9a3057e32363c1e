//! Box hardware behind the core's collaborator traits.
//!
//! The hopper and cameras are driven by external scripts so the daemon does
//! not need to know the wiring of a particular box. Scripts are spawned and
//! reaped on a helper thread; the session loop never waits on them.

use std::path::PathBuf;
use std::process::{Child, Command};

use chrono::NaiveDate;
use operant::config::Phase;
use operant::error::HardwareWarning;
use operant::io::{Renderer, ReinforcementDevice, Screen, VideoFiles, VideoRecorder};
use operant::timer::Millis;
use operant::trial::TrialKind;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

fn spawn(device: &'static str, argv: &[String], extra: &[String]) -> Result<(), HardwareWarning> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let child: Child = Command::new(program)
        .args(args)
        .args(extra)
        .spawn()
        .map_err(|e| HardwareWarning::new(device, format!("{program}: {e}")))?;
    std::thread::spawn(move || {
        let mut child = child;
        match child.wait() {
            Ok(status) if !status.success() => {
                warn!(device, %status, "Device script exited with failure")
            }
            Ok(_) => {}
            Err(e) => warn!(device, "Device script wait failed: {}", e),
        }
    });
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Screen
// ═══════════════════════════════════════════════════════════════════════════

/// Fans screens out to subscribed display clients.
pub struct BroadcastRenderer {
    tx: broadcast::Sender<Screen>,
}

impl BroadcastRenderer {
    pub fn new(tx: broadcast::Sender<Screen>) -> Self {
        Self { tx }
    }
}

impl Renderer for BroadcastRenderer {
    fn show(&mut self, screen: &Screen) {
        debug!(?screen, "Screen");
        // No subscribers is fine: the session runs headless.
        let _ = self.tx.send(screen.clone());
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Hopper
// ═══════════════════════════════════════════════════════════════════════════

pub struct CommandHopper {
    up: Vec<String>,
    down: Vec<String>,
    raised: bool,
}

impl CommandHopper {
    pub fn new(up: Vec<String>, down: Vec<String>) -> Self {
        if up.is_empty() {
            info!("No hopper command configured; hopper is simulated");
        }
        Self {
            up,
            down,
            raised: false,
        }
    }
}

impl ReinforcementDevice for CommandHopper {
    fn open(&mut self, duration_ms: Millis) -> Result<(), HardwareWarning> {
        info!(duration_ms, "Hopper up");
        self.raised = true;
        spawn("hopper", &self.up, &[])
    }

    fn close(&mut self) -> Result<(), HardwareWarning> {
        if !self.raised {
            return Ok(());
        }
        info!("Hopper down");
        self.raised = false;
        spawn("hopper", &self.down, &[])
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Cameras
// ═══════════════════════════════════════════════════════════════════════════

/// Top and side cameras driven by start/stop scripts.
pub struct ScriptRecorder {
    start: Vec<String>,
    stop: Vec<String>,
    dir: PathBuf,
    subject: String,
    phase: Phase,
    date: NaiveDate,
}

impl ScriptRecorder {
    pub fn new(
        start: Vec<String>,
        stop: Vec<String>,
        dir: PathBuf,
        subject: &str,
        phase: Phase,
        date: NaiveDate,
    ) -> Self {
        Self {
            start,
            stop,
            dir,
            subject: subject.to_string(),
            phase,
            date,
        }
    }

    /// `{subject}_Phase{n}_{date}_Trial{t}-{type}_TOPcam.mp4` and the
    /// matching `_SIDEcam.mp4`.
    pub fn file_names(&self, trial: u32, kind: TrialKind) -> VideoFiles {
        let base = format!(
            "{}_Phase{}_{}_Trial{}-{}",
            self.subject,
            self.phase.number(),
            self.date.format("%Y-%m-%d"),
            trial,
            kind.label()
        );
        VideoFiles {
            top: format!("{base}_TOPcam.mp4"),
            side: format!("{base}_SIDEcam.mp4"),
        }
    }
}

impl VideoRecorder for ScriptRecorder {
    fn start(&mut self, trial: u32, kind: TrialKind) -> Result<VideoFiles, HardwareWarning> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| HardwareWarning::new("camera", format!("{}: {e}", self.dir.display())))?;
        let files = self.file_names(trial, kind);
        let paths = [
            self.dir.join(&files.top).display().to_string(),
            self.dir.join(&files.side).display().to_string(),
        ];
        spawn("camera", &self.start, &paths)?;
        Ok(files)
    }

    fn stop(&mut self, trial: u32) -> Result<(), HardwareWarning> {
        spawn("camera", &self.stop, &[trial.to_string()])
    }
}
