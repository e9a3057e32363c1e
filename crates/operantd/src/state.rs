//! Daemon state: the one session this box is running, plus what is needed
//! to prepare the next.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use operant::io::SessionContext;
use operant::log::NullSink;
use operant::prelude::*;
use operant::schedule::Response as Touch;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::devices::{BroadcastRenderer, CommandHopper, ScriptRecorder};
use crate::paths::AppPaths;
use crate::protocol::{DaemonStatus, SubjectEntry};
use crate::DaemonError;

/// A prepared or running session on the wall clock.
pub struct ActiveSession {
    controller: SessionController,
    /// Wall-clock instant of logical time 0.
    origin: Instant,
    data_file: Option<PathBuf>,
}

impl ActiveSession {
    fn now_ms(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }

    /// Wall-clock instant of the controller's next timer.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.controller
            .next_deadline()
            .map(|ms| self.origin + Duration::from_millis(ms))
    }
}

pub struct DaemonState {
    paths: AppPaths,
    config: DaemonConfig,
    catalog: Catalog,
    screens: broadcast::Sender<Screen>,
    session: Option<ActiveSession>,
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl DaemonState {
    pub fn new(paths: AppPaths, config: DaemonConfig, catalog: Catalog) -> Self {
        let (screens, _) = broadcast::channel(256);
        Self {
            paths,
            config,
            catalog,
            screens,
            session: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Screen> {
        self.screens.subscribe()
    }

    fn active_mut(&mut self) -> Result<&mut ActiveSession, DaemonError> {
        self.session.as_mut().ok_or(DaemonError::NoSession)
    }

    pub fn status(&self) -> DaemonStatus {
        match &self.session {
            Some(s) => DaemonStatus {
                session: Some(s.controller.snapshot()),
                substage: s.controller.current_substage(),
                data_file: s.data_file.as_ref().map(|p| p.display().to_string()),
            },
            None => DaemonStatus::default(),
        }
    }

    pub fn subjects(&self) -> Vec<SubjectEntry> {
        let registry = &self.config.experiment.subjects;
        registry
            .names()
            .into_iter()
            .filter_map(|name| {
                registry.get(name).map(|p| SubjectEntry {
                    name: name.to_string(),
                    group: p.group,
                    test: p.test,
                })
            })
            .collect()
    }

    pub fn preview(
        &self,
        subject: &str,
        phase: &str,
        seed: Option<u64>,
    ) -> Result<TrialPlan, DaemonError> {
        let phase: Phase = phase.parse().map_err(SessionError::from)?;
        let experiment = &self.config.experiment;
        let (group, _) = experiment.subjects.resolve(subject).map_err(SessionError::from)?;
        let plan = SequenceGenerator::new(experiment, phase, seed.unwrap_or_else(clock_seed))
            .generate(&self.catalog, group)
            .map_err(SessionError::from)?;
        Ok(plan)
    }

    /// Build the plan and hardware for a session and show the "place
    /// subject" screen. A finished session is replaced; a live one is not.
    pub fn start_session(
        &mut self,
        subject: &str,
        phase: &str,
        seed: Option<u64>,
        record_video: Option<bool>,
    ) -> Result<String, DaemonError> {
        if let Some(active) = &self.session {
            if !active.controller.is_finished() {
                return Err(DaemonError::Busy(active.controller.setup().subject.clone()));
            }
        }

        let experiment = &self.config.experiment;
        let phase: Phase = phase.parse().map_err(SessionError::from)?;
        let setup = SessionSetup {
            subject: subject.to_string(),
            phase,
            seed: seed.unwrap_or_else(clock_seed),
            started_at: chrono::Local::now().naive_local(),
            record_video: record_video.unwrap_or(experiment.record_video),
        };
        // Fail on an unknown subject before creating any files.
        experiment.subjects.resolve(subject).map_err(SessionError::from)?;

        let renderer = BroadcastRenderer::new(self.screens.clone());
        let hopper = CommandHopper::new(self.config.hopper.up.clone(), self.config.hopper.down.clone());
        let (mut ctx, data_file) = if experiment.record_data {
            let path = self.paths.session_file(subject, setup.started_at, phase);
            let sink = operant::log::CsvFileSink::create(&path)?;
            (SessionContext::new(renderer, hopper, sink), Some(path))
        } else {
            (SessionContext::new(renderer, hopper, NullSink), None)
        };

        if setup.record_video && self.config.video.is_configured() {
            let dir = match &self.config.video.dir {
                Some(dir) => dir.join(subject),
                None => self.paths.videos_dir(subject),
            };
            ctx = ctx.with_recorder(ScriptRecorder::new(
                self.config.video.start.clone(),
                self.config.video.stop.clone(),
                dir,
                subject,
                phase,
                setup.started_at.date(),
            ));
        }

        let seed = setup.seed;
        let controller = match SessionController::prepare(experiment, &self.catalog, setup, ctx) {
            Ok(controller) => controller,
            Err(e) => {
                // Drop the header-only file of a session that never existed.
                if let Some(path) = &data_file {
                    if let Err(io) = std::fs::remove_file(path) {
                        warn!(path = %path.display(), error = %io, "Failed to remove data file");
                    }
                }
                return Err(e.into());
            }
        };
        let trials = controller.plan().len();
        if let Some(path) = &data_file {
            info!(path = %path.display(), "Recording session data");
        }
        self.session = Some(ActiveSession {
            controller,
            origin: Instant::now(),
            data_file,
        });
        Ok(format!(
            "Prepared {subject} for {} (seed {seed}, {trials} trials); place subject and begin",
            phase.display_name()
        ))
    }

    pub fn begin(&mut self) -> Result<String, DaemonError> {
        let s = self.active_mut()?;
        if s.controller.stage() != Stage::AwaitingSubject {
            return Err(DaemonError::AlreadyStarted);
        }
        let now = s.now_ms();
        s.controller.begin(now);
        Ok("Session started".to_string())
    }

    pub fn touch(&mut self, target: Target, x: f64, y: f64) -> Result<(), DaemonError> {
        let s = self.active_mut()?;
        let now = s.now_ms();
        s.controller.handle_response(Touch::new(target, x, y), now);
        Ok(())
    }

    pub fn abort(&mut self) -> Result<String, DaemonError> {
        let s = self.active_mut()?;
        if s.controller.is_finished() {
            return Ok("Session already ended".to_string());
        }
        let now = s.now_ms();
        s.controller.abort(now);
        Ok("Session aborted".to_string())
    }

    /// Fire whatever timers are due.
    pub fn tick(&mut self) {
        if let Some(s) = self.session.as_mut() {
            if s.controller.stage() != Stage::AwaitingSubject {
                let now = s.now_ms();
                s.controller.advance_to(now);
            }
        }
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.session.as_ref().and_then(ActiveSession::next_wakeup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(record_data: bool) -> (tempfile::TempDir, DaemonState) {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path()).unwrap();
        let mut config = DaemonConfig::default();
        config.experiment.record_data = record_data;
        (dir, DaemonState::new(paths, config, Catalog::builtin_gradient_set()))
    }

    #[test]
    fn lifecycle_over_protocol_calls() {
        let (_dir, mut s) = state(true);
        assert!(matches!(s.begin(), Err(DaemonError::NoSession)));

        let mut screens = s.subscribe();
        s.start_session("TEST", "pretraining", Some(3), None).unwrap();
        assert!(matches!(
            screens.try_recv().unwrap(),
            Screen::AwaitingSubject { .. }
        ));
        let status = s.status();
        let file = status.data_file.clone().unwrap();
        assert!(file.ends_with("_data-Phase0.csv"));
        assert_eq!(status.session.unwrap().stage, "awaiting_subject");

        // A live session blocks a second start.
        assert!(matches!(
            s.start_session("TEST", "choice", None, None),
            Err(DaemonError::Busy(_))
        ));

        s.begin().unwrap();
        assert!(matches!(s.begin(), Err(DaemonError::AlreadyStarted)));
        s.touch(Target::Background, 10.0, 10.0).unwrap();
        s.abort().unwrap();
        let snap = s.status().session.unwrap();
        assert_eq!(snap.end_reason, Some(EndReason::Aborted));
        assert!(s.next_wakeup().is_none());

        let text = std::fs::read_to_string(&file).unwrap();
        assert!(text.lines().last().unwrap().contains(",SessionEnds,"));

        // Ended sessions can be replaced.
        s.start_session("TEST", "choice", Some(4), None).unwrap();
    }

    #[test]
    fn unknown_subject_creates_no_file() {
        let (dir, mut s) = state(true);
        let err = s.start_session("Nobody", "choice", None, None).unwrap_err();
        assert!(matches!(err, DaemonError::Session(_)));
        assert!(!dir.path().join("sessions").exists());
    }

    #[test]
    fn failed_preparation_leaves_no_data_file() {
        let (dir, mut s) = state(true);
        s.config.experiment.choice.iti_min_ms = 30_000;
        s.config.experiment.choice.iti_max_ms = 10_000;
        let err = s.start_session("TEST", "choice", Some(5), None).unwrap_err();
        assert!(matches!(err, DaemonError::Session(_)));
        assert!(s.status().session.is_none());

        let sessions = dir.path().join("sessions").join("TEST");
        if sessions.exists() {
            let left: Vec<_> = std::fs::read_dir(&sessions)
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .collect();
            assert!(left.is_empty(), "stray files: {left:?}");
        }
    }

    #[test]
    fn data_recording_can_be_disabled() {
        let (_dir, mut s) = state(false);
        s.start_session("TEST", "1", Some(1), None).unwrap();
        assert!(s.status().data_file.is_none());
    }

    #[test]
    fn subjects_and_preview() {
        let (_dir, s) = state(false);
        assert_eq!(
            s.subjects(),
            vec![SubjectEntry {
                name: "TEST".to_string(),
                group: 1,
                test: true,
            }]
        );
        let plan = s.preview("TEST", "choice", Some(8)).unwrap();
        assert_eq!(plan.len(), 80);
        assert!(s.preview("TEST", "phase9", None).is_err());
    }
}
