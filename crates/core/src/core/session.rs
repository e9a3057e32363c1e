//! Session controller.
//!
//! Drives one subject through one phase: first delay, then ITI → trial →
//! outcome, repeated over the plan until the trial limit, the plan end, the
//! wall-clock limit or an operator abort. The controller never blocks. The
//! host feeds it touches with [`SessionController::handle_response`] and
//! moves its clock with [`SessionController::advance_to`], sleeping until
//! [`SessionController::next_deadline`] in between.

use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::{ExperimentConfig, Phase, PhaseParams};
use crate::error::{HardwareWarning, SessionError};
use crate::io::{Screen, SessionContext, VideoFiles};
use crate::log::{pixel_distance, EventKind, EventRecord, SessionLog, SideColumns};
use crate::schedule::{
    ReinforcementCause, Response, ScheduleEngine, Substage, Target, TrialOutcome, TrialState,
    Transition,
};
use crate::sequence::SequenceGenerator;
use crate::stats::SessionStats;
use crate::timer::{Millis, TimerId, TimerQueue};
use crate::trial::{Payload, Side, TrialPlan};

/// Salt so ITI draws do not replay the plan's random stream.
const ITI_SEED_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndReason {
    TrialsCompleted,
    TimeCompleted,
    Aborted,
}

impl EndReason {
    pub fn label(self) -> &'static str {
        match self {
            EndReason::TrialsCompleted => "TrialsCompleted",
            EndReason::TimeCompleted => "TimeCompleted",
            EndReason::Aborted => "Aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Prepared; waiting for the operator to confirm the subject is in.
    AwaitingSubject,
    FirstDelay,
    Iti,
    Trial,
    Reinforcement,
    CorrectionTimeout,
    Ended(EndReason),
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::AwaitingSubject => "awaiting_subject",
            Stage::FirstDelay => "first_delay",
            Stage::Iti => "iti",
            Stage::Trial => "trial",
            Stage::Reinforcement => "reinforcement",
            Stage::CorrectionTimeout => "correction_timeout",
            Stage::Ended(_) => "ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    FirstIti,
    ItiEnd,
    VideoLead,
    PresentStimulus,
    AutoReinforce,
    HopperClose,
    CorrectionEnd,
    SessionDeadline,
}

/// Who, what and when for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSetup {
    pub subject: String,
    pub phase: Phase,
    pub seed: u64,
    /// Wall-clock start, used for record dates and the data file name.
    pub started_at: NaiveDateTime,
    pub record_video: bool,
}

/// Read-only view for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub subject: String,
    pub phase: Phase,
    pub seed: u64,
    pub stage: String,
    pub trial_num: u32,
    pub planned_trials: u32,
    pub max_trials: u32,
    pub session_time_ms: Millis,
    pub correction: bool,
    pub end_reason: Option<EndReason>,
    pub stats: SessionStats,
}

pub struct SessionController {
    config: ExperimentConfig,
    setup: SessionSetup,
    test_subject: bool,
    plan: TrialPlan,
    ctx: SessionContext,
    rng: StdRng,

    timers: TimerQueue<TimerKind>,
    log: SessionLog,
    stats: SessionStats,

    stage: Stage,
    now: Millis,
    /// Clock value when the subject was confirmed in the box.
    origin: Millis,
    trial_num: u32,
    iti_ms: Option<Millis>,
    iti_started_at: Millis,
    engine: Option<ScheduleEngine>,
    auto_timer: Option<TimerId>,
    video: Option<VideoFiles>,
    recording: bool,
}

impl SessionController {
    /// Resolve the subject, build the plan and get ready for `begin`.
    pub fn prepare(
        config: &ExperimentConfig,
        catalog: &Catalog,
        setup: SessionSetup,
        ctx: SessionContext,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (group, _) = config.subjects.resolve(&setup.subject)?;
        let plan = SequenceGenerator::new(config, setup.phase, setup.seed).generate(catalog, group)?;
        Self::with_plan(config, setup, plan, ctx)
    }

    /// Like [`prepare`](Self::prepare) with a plan built elsewhere.
    pub fn with_plan(
        config: &ExperimentConfig,
        setup: SessionSetup,
        plan: TrialPlan,
        mut ctx: SessionContext,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (_, profile) = config.subjects.resolve(&setup.subject)?;
        let test_subject = profile.test;

        ctx.renderer.show(&Screen::AwaitingSubject {
            subject: setup.subject.clone(),
            phase: setup.phase.display_name().to_string(),
        });
        info!(
            subject = %setup.subject,
            phase = %setup.phase,
            seed = setup.seed,
            trials = plan.len(),
            video = setup.record_video,
            "Session prepared"
        );

        Ok(Self {
            config: config.clone(),
            rng: StdRng::seed_from_u64(setup.seed ^ ITI_SEED_SALT),
            setup,
            test_subject,
            plan,
            ctx,
            timers: TimerQueue::new(),
            log: SessionLog::new(),
            stats: SessionStats::new(),
            stage: Stage::AwaitingSubject,
            now: 0,
            origin: 0,
            trial_num: 0,
            iti_ms: None,
            iti_started_at: 0,
            engine: None,
            auto_timer: None,
            video: None,
            recording: false,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn setup(&self) -> &SessionSetup {
        &self.setup
    }

    pub fn plan(&self) -> &TrialPlan {
        &self.plan
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn trial_num(&self) -> u32 {
        self.trial_num
    }

    pub fn now(&self) -> Millis {
        self.now
    }

    pub fn is_test_subject(&self) -> bool {
        self.test_subject
    }

    /// State of the current trial attempt, if a trial has started.
    pub fn current_state(&self) -> Option<&TrialState> {
        self.engine.as_ref().map(|e| e.state())
    }

    pub fn current_substage(&self) -> Option<Substage> {
        match self.stage {
            Stage::Trial => self.engine.as_ref().map(|e| e.substage()),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.stage, Stage::Ended(_))
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        match self.stage {
            Stage::Ended(r) => Some(r),
            _ => None,
        }
    }

    /// Earliest pending timer; the host should call `advance_to` then.
    pub fn next_deadline(&self) -> Option<Millis> {
        if self.is_finished() {
            None
        } else {
            self.timers.next_due()
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            subject: self.setup.subject.clone(),
            phase: self.setup.phase,
            seed: self.setup.seed,
            stage: self.stage.label().to_string(),
            trial_num: self.trial_num,
            planned_trials: self.plan.len() as u32,
            max_trials: self.params().max_trials,
            session_time_ms: self.session_time(),
            correction: self
                .current_state()
                .map(|s| s.correction)
                .unwrap_or(false),
            end_reason: self.end_reason(),
            stats: self.stats.clone(),
        }
    }

    fn params(&self) -> &PhaseParams {
        self.config.phase(self.setup.phase)
    }

    fn session_time(&self) -> Millis {
        self.now.saturating_sub(self.origin)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Host entry points
    // ─────────────────────────────────────────────────────────────────────

    /// The subject is in the box: start the session clock.
    pub fn begin(&mut self, now: Millis) {
        if self.stage != Stage::AwaitingSubject {
            warn!(stage = self.stage.label(), "begin ignored; session already started");
            return;
        }
        self.now = now;
        self.origin = now;
        self.record(EventKind::SessionStarted, None);
        info!(subject = %self.setup.subject, phase = %self.setup.phase, "Session started");

        self.timers
            .schedule(now + self.config.session_limit_ms(), TimerKind::SessionDeadline);
        let delay = if self.test_subject {
            0
        } else {
            self.config.timing.first_iti_ms
        };
        self.stage = Stage::FirstDelay;
        self.ctx.renderer.show(&Screen::Iti { ms: delay });
        self.timers.schedule(now + delay, TimerKind::FirstIti);
        self.advance_to(now);
    }

    /// Fire every timer due at or before `now`, in deadline order.
    pub fn advance_to(&mut self, now: Millis) {
        while !self.is_finished() {
            let Some((_, due, kind)) = self.timers.pop_due(now) else {
                break;
            };
            self.now = self.now.max(due);
            self.on_timer(kind);
        }
        self.now = self.now.max(now);
    }

    /// A touch from the renderer. Timers due before `now` fire first.
    pub fn handle_response(&mut self, response: Response, now: Millis) {
        self.advance_to(now);
        if matches!(self.stage, Stage::AwaitingSubject | Stage::Ended(_)) {
            debug!(target = response.target.as_str(), "Touch outside session ignored");
            return;
        }
        self.stats.pecks += 1;

        let event = match self.stage {
            Stage::FirstDelay | Stage::Iti => EventKind::ItiPeck,
            Stage::Reinforcement => EventKind::HopperPeck,
            Stage::CorrectionTimeout => EventKind::CorrectionBackgroundPeck,
            Stage::Trial => self.trial_peck_kind(response.target),
            Stage::AwaitingSubject | Stage::Ended(_) => return,
        };
        self.record(event, Some(&response));

        if self.stage != Stage::Trial {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let choosing =
            engine.is_two_alternative() && engine.substage() == Substage::StimulusActive;
        let transition = engine.handle(response.target, now);

        match transition {
            Transition::None | Transition::Counted { .. } => {}
            Transition::EnteredTerminalLink { choice } => {
                self.record(choice_event(choice), Some(&response));
                self.choice_made(choice);
                self.ctx.renderer.show(&Screen::TerminalLink {
                    trial: self.trial_num,
                });
            }
            Transition::Resolved(outcome) => {
                if choosing {
                    if let Some(side) = outcome_choice(outcome) {
                        self.record(choice_event(side), Some(&response));
                    }
                }
                self.resolve(outcome);
            }
        }
    }

    /// Operator stop.
    pub fn abort(&mut self, now: Millis) {
        if self.is_finished() {
            return;
        }
        self.now = self.now.max(now);
        self.end(EndReason::Aborted);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Flow
    // ─────────────────────────────────────────────────────────────────────

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::FirstIti => self.enter_iti(),
            TimerKind::ItiEnd => self.substage_one(),
            TimerKind::VideoLead => self.start_video(),
            TimerKind::PresentStimulus => self.present(),
            TimerKind::AutoReinforce => {
                self.auto_timer = None;
                let outcome = self.engine.as_mut().and_then(|e| e.auto_reinforce());
                if let Some(outcome) = outcome {
                    self.resolve(outcome);
                }
            }
            TimerKind::HopperClose => {
                if let Err(w) = self.ctx.hopper.close() {
                    self.hardware_warning(w);
                }
                self.record(EventKind::HopperClosed, None);
                self.enter_iti();
            }
            TimerKind::CorrectionEnd => {
                let now = self.now;
                if let Some(engine) = self.engine.as_mut() {
                    engine.restart_for_correction(now);
                }
                self.substage_one();
            }
            TimerKind::SessionDeadline => {
                info!("Session time limit reached");
                self.end(EndReason::TimeCompleted);
            }
        }
    }

    fn enter_iti(&mut self) {
        self.stop_video();
        self.video = None;

        let max_trials = self.params().max_trials;
        if self.trial_num >= max_trials {
            info!(trials = self.trial_num, "Trial limit reached");
            self.end(EndReason::TrialsCompleted);
            return;
        }

        self.flush_log();

        let Some(descriptor) = self.plan.get(self.trial_num + 1).cloned() else {
            info!(trials = self.trial_num, "Trial plan exhausted");
            self.end(EndReason::TrialsCompleted);
            return;
        };

        self.trial_num += 1;
        let (iti_min, iti_max) = {
            let p = self.params();
            (p.iti_min_ms, p.iti_max_ms)
        };
        let iti = if self.test_subject {
            self.config.timing.test_iti_ms
        } else {
            self.rng.gen_range(iti_min..=iti_max)
        };

        let now = self.now;
        self.engine = Some(ScheduleEngine::new(descriptor, false, now));
        self.iti_ms = Some(iti);
        self.iti_started_at = now;
        self.stage = Stage::Iti;
        self.stats.itis += 1;
        self.record(EventKind::ItiStart, None);
        self.ctx.renderer.show(&Screen::Iti { ms: iti });
        debug!(trial = self.trial_num, iti_ms = iti, "ITI started");

        if self.wants_video() && self.setup.phase.is_two_alternative() {
            let lead = self.config.timing.video_lead_ms;
            self.timers
                .schedule(now + iti.saturating_sub(lead), TimerKind::VideoLead);
        }
        self.timers.schedule(now + iti, TimerKind::ItiEnd);
    }

    /// Trial start: blank keys, then the stimulus after the trial delay.
    fn substage_one(&mut self) {
        self.stage = Stage::Trial;
        self.record(EventKind::TrialStart, None);

        let delay = self.params().trial_delay_ms.map(|d| {
            if self.test_subject {
                self.config.timing.test_trial_delay_ms
            } else {
                d
            }
        });
        match delay {
            Some(delay) => {
                self.ctx.renderer.show(&Screen::Blank);
                if !self.setup.phase.is_two_alternative() {
                    self.start_video();
                }
                self.timers
                    .schedule(self.now + delay, TimerKind::PresentStimulus);
            }
            None => self.present(),
        }
    }

    fn present(&mut self) {
        let now = self.now;
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        engine.present(now);
        let two_alternative = engine.is_two_alternative();
        let payload = engine.descriptor().payload.clone();

        self.stats.trials_presented += 1;
        self.record(EventKind::StimulusOnset, None);
        self.ctx.renderer.show(&Screen::Stimulus {
            trial: self.trial_num,
            payload,
        });

        let auto_ms = self.params().auto_reinforce_ms;
        if !two_alternative {
            if let Some(ms) = auto_ms {
                self.auto_timer = Some(self.timers.schedule(now + ms, TimerKind::AutoReinforce));
            }
        }
    }

    fn resolve(&mut self, outcome: TrialOutcome) {
        if let Some(id) = self.auto_timer.take() {
            self.timers.cancel(id);
        }

        match outcome {
            TrialOutcome::Reinforced { cause, .. } => {
                match cause {
                    ReinforcementCause::CorrectChoice => {
                        self.record(EventKind::CorrectChoice, None);
                        self.stats.record_sbe(true);
                    }
                    ReinforcementCause::TerminalLink => {
                        self.record(EventKind::TerminalLinkCompleted, None);
                    }
                    ReinforcementCause::Ratio | ReinforcementCause::AutoTimer => {}
                }
                let auto = cause == ReinforcementCause::AutoTimer;
                self.record(
                    if auto {
                        EventKind::AutoReinforcerProvided
                    } else {
                        EventKind::ReinforcerProvided
                    },
                    None,
                );
                self.stats.record_reinforcement(auto);

                let hopper_ms = if self.test_subject {
                    self.config.timing.test_hopper_ms
                } else {
                    self.config.timing.hopper_ms
                };
                if let Err(w) = self.ctx.hopper.open(hopper_ms) {
                    self.hardware_warning(w);
                }
                self.stage = Stage::Reinforcement;
                self.ctx
                    .renderer
                    .show(&Screen::Reinforcement { auto, hopper_ms });
                self.timers
                    .schedule(self.now + hopper_ms, TimerKind::HopperClose);
            }
            TrialOutcome::FreeChoice { choice } => {
                self.choice_made(choice);
                self.enter_iti();
            }
            TrialOutcome::CorrectionTimeout { .. } => {
                self.record(EventKind::IncorrectChoice, None);
                self.stats.record_sbe(false);
                // Every row from here to the repeat's resolution is part of
                // the correction.
                if let Some(engine) = self.engine.as_mut() {
                    engine.mark_correction();
                }
                self.stop_video();

                let ms = self.config.timing.correction_timeout_ms;
                self.stage = Stage::CorrectionTimeout;
                self.record(EventKind::CorrectionTimeout, None);
                self.ctx.renderer.show(&Screen::CorrectionTimeout { ms });
                self.timers
                    .schedule(self.now + ms, TimerKind::CorrectionEnd);
            }
        }
    }

    /// Consequences of a completed choice that do not depend on food: the
    /// SBE verdict or the free-choice records. Incorrect SBE choices go
    /// through the correction timeout instead.
    fn choice_made(&mut self, side: Side) {
        let Some(d) = self.engine.as_ref().map(|e| e.descriptor()) else {
            return;
        };
        let sbe = d.correct_side.is_some();
        let fed = d.terminal_link_ratio.is_some();
        let chosen = match side {
            Side::Left => d.payload.left(),
            Side::Right => d.payload.right(),
        }
        .map(|stim| stim.label().to_string());

        if sbe {
            self.record(EventKind::CorrectChoice, None);
            self.stats.record_sbe(true);
            return;
        }
        if let Some(stem) = chosen {
            let mut r = self.build_record(EventKind::StimulusChoice, None);
            r.chosen_stim = Some(stem);
            self.log.push(r);
        }
        self.record(EventKind::FreeChoice, None);
        self.stats.record_free_choice(side, fed);
    }

    fn end(&mut self, reason: EndReason) {
        if self.is_finished() {
            return;
        }
        self.timers.clear();
        self.auto_timer = None;
        self.stop_video();
        if let Err(w) = self.ctx.hopper.close() {
            self.hardware_warning(w);
        }

        self.stage = Stage::Ended(reason);
        self.record(EventKind::SessionEnds, None);
        self.flush_log();
        self.ctx.renderer.show(&Screen::SessionEnded { reason });
        info!(
            reason = reason.label(),
            trials = self.trial_num,
            reinforcements = self.stats.reinforcements,
            session_time_ms = self.session_time(),
            "Session ended"
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Collaborators
    // ─────────────────────────────────────────────────────────────────────

    fn wants_video(&self) -> bool {
        self.setup.record_video && self.ctx.recorder.is_some()
    }

    fn start_video(&mut self) {
        if !self.wants_video() || self.recording {
            return;
        }
        let Some(kind) = self.engine.as_ref().map(|e| e.descriptor().kind) else {
            return;
        };
        let trial = self.trial_num;
        let Some(recorder) = self.ctx.recorder.as_mut() else {
            return;
        };
        match recorder.start(trial, kind) {
            Ok(files) => {
                self.video = Some(files);
                self.recording = true;
                self.record(EventKind::VideoRecordingStarted, None);
            }
            Err(w) => self.hardware_warning(w),
        }
    }

    fn stop_video(&mut self) {
        if !self.recording {
            return;
        }
        self.recording = false;
        let trial = self.trial_num;
        if let Some(recorder) = self.ctx.recorder.as_mut() {
            if let Err(w) = recorder.stop(trial) {
                self.hardware_warning(w);
            }
        }
        self.record(EventKind::VideoRecordingStopped, None);
    }

    fn hardware_warning(&mut self, w: HardwareWarning) {
        warn!(device = w.device, "Hardware warning: {}", w.message);
        self.record(EventKind::HardwareWarning, None);
    }

    fn flush_log(&mut self) {
        if let Err(e) = self.log.flush(&mut *self.ctx.sink) {
            warn!(
                pending = self.log.pending().len(),
                "Log flush failed, will retry: {}", e
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Records
    // ─────────────────────────────────────────────────────────────────────

    fn trial_peck_kind(&self, target: Target) -> EventKind {
        let active = self
            .engine
            .as_ref()
            .map(|e| e.substage() != Substage::Blank)
            .unwrap_or(false);
        if !active {
            return EventKind::BackgroundPeck;
        }
        match target {
            Target::Background => EventKind::BackgroundPeck,
            Target::Stimulus if self.setup.phase == Phase::Pretraining => {
                EventKind::PretrainingKeyPeck
            }
            Target::Stimulus => EventKind::StimulusKeyPeck,
            Target::Left => EventKind::LeftStimulusKeyPeck,
            Target::Right => EventKind::RightStimulusKeyPeck,
            Target::TerminalLink => EventKind::TerminalLinkKeyPeck,
        }
    }

    fn record(&mut self, event: EventKind, response: Option<&Response>) {
        let r = self.build_record(event, response);
        self.log.push(r);
    }

    fn build_record(&self, event: EventKind, response: Option<&Response>) -> EventRecord {
        let elapsed = self.session_time();
        let date = (self.setup.started_at + chrono::Duration::milliseconds(elapsed as i64)).date();
        let mut r = EventRecord::new(
            self.setup.subject.as_str(),
            date,
            self.setup.phase,
            elapsed,
            event,
        );
        r.trial_num = self.trial_num;
        r.iti_ms = self.iti_ms;
        r.video_recorded = self.video.is_some();
        if let Some(files) = &self.video {
            r.top_video = Some(files.top.clone());
            r.side_video = Some(files.side.clone());
        }

        if let Some(resp) = response {
            let layout = &self.config.layout;
            r.x = Some(resp.x);
            r.y = Some(resp.y);
            r.center_dist = Some(pixel_distance(resp.x, resp.y, layout.center));
            r.left_dist = Some(pixel_distance(resp.x, resp.y, layout.left));
            r.right_dist = Some(pixel_distance(resp.x, resp.y, layout.right));
        }

        if let Some(engine) = &self.engine {
            let d = engine.descriptor();
            let s = engine.state();
            let iti_end = self.iti_started_at + self.iti_ms.unwrap_or(0);
            r.trial_type = Some(d.kind.label());
            r.substage = Some(match self.stage {
                Stage::Iti | Stage::FirstDelay => 0,
                _ => engine.substage_number(),
            });
            r.trial_time_ms = Some(self.now as i64 - iti_end as i64);
            r.substage_time_ms = Some(self.now.saturating_sub(s.substage_started_at));
            r.correction = s.correction;

            match &d.payload {
                Payload::None | Payload::Single { .. } => {
                    r.center_stim = Some(match d.payload.center() {
                        Some(stim) => stim.label().to_string(),
                        None => "control_circle".to_string(),
                    });
                    r.subphase2_ratio = Some(d.ratio);
                    r.subphase2_presses = Some(s.center_count);
                }
                Payload::Pair { left, right } => {
                    r.left = SideColumns {
                        stim: Some(left.label().to_string()),
                        training_set: Some(left.training_set),
                        number: Some(left.number),
                        color: None,
                    };
                    r.right = SideColumns {
                        stim: Some(right.label().to_string()),
                        training_set: Some(right.training_set),
                        number: Some(right.number),
                        color: None,
                    };
                }
                Payload::Colors { left, right } => {
                    r.left = SideColumns {
                        stim: Some(format!("{left}_SBE")),
                        color: Some(left.clone()),
                        ..SideColumns::default()
                    };
                    r.right = SideColumns {
                        stim: Some(format!("{right}_SBE")),
                        color: Some(right.clone()),
                        ..SideColumns::default()
                    };
                    r.correct_choice = d.correct_side;
                }
            }
            if d.kind.is_two_alternative() {
                r.subphase1_ratio = Some(d.ratio);
                r.subphase1_left = Some(s.left_count);
                r.subphase1_right = Some(s.right_count);
                if let Some(ratio) = engine.terminal_link_ratio() {
                    r.subphase2_ratio = Some(ratio);
                    r.subphase2_presses = Some(s.terminal_count);
                }
            }
        }
        r
    }
}

fn choice_event(side: Side) -> EventKind {
    match side {
        Side::Left => EventKind::LeftStimulusChoice,
        Side::Right => EventKind::RightStimulusChoice,
    }
}

fn outcome_choice(outcome: TrialOutcome) -> Option<Side> {
    match outcome {
        TrialOutcome::Reinforced { choice, .. } => choice,
        TrialOutcome::FreeChoice { choice } | TrialOutcome::CorrectionTimeout { choice } => {
            Some(choice)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubjectProfile;
    use crate::io::RecordingRenderer;
    use crate::log::MemorySink;
    use crate::trial::{TrialDescriptor, TrialKind};

    fn setup(subject: &str, phase: Phase) -> SessionSetup {
        SessionSetup {
            subject: subject.to_string(),
            phase,
            seed: 17,
            started_at: chrono::NaiveDate::from_ymd_opt(2026, 5, 4)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            record_video: false,
        }
    }

    fn one_trial_plan(ratio: u32) -> TrialPlan {
        TrialPlan {
            phase: Phase::Pretraining,
            seed: 0,
            group: 1,
            trials: vec![TrialDescriptor {
                index: 1,
                kind: TrialKind::Pretraining,
                payload: Payload::None,
                ratio,
                correct_side: None,
                terminal_link_ratio: None,
            }],
        }
    }

    fn peck(target: Target) -> Response {
        Response::new(target, 512.0, 584.0)
    }

    #[test]
    fn unknown_subject_fails_setup() {
        let cfg = ExperimentConfig::default();
        let err = SessionController::prepare(
            &cfg,
            &Catalog::builtin_gradient_set(),
            setup("Nobody", Phase::Pretraining),
            SessionContext::null(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn invalid_config_fails_setup_with_a_plan() {
        let mut cfg = ExperimentConfig::default();
        cfg.pretraining.iti_min_ms = 30_000;
        cfg.pretraining.iti_max_ms = 10_000;
        let err = SessionController::with_plan(
            &cfg,
            setup("TEST", Phase::Pretraining),
            one_trial_plan(1),
            SessionContext::null(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn first_delay_then_trial_timeline() {
        let mut cfg = ExperimentConfig::default();
        cfg.subjects.insert("Jubilee", SubjectProfile { group: 1, test: false });
        cfg.pretraining.iti_min_ms = 12_000;
        cfg.pretraining.iti_max_ms = 12_000;

        let renderer = RecordingRenderer::new();
        let ctx = SessionContext::new(renderer.clone(), crate::io::NullHopper, MemorySink::new());
        let mut s = SessionController::with_plan(
            &cfg,
            setup("Jubilee", Phase::Pretraining),
            one_trial_plan(2),
            ctx,
        )
        .unwrap();
        assert!(matches!(renderer.last(), Some(Screen::AwaitingSubject { .. })));

        s.begin(1_000);
        assert_eq!(s.stage(), Stage::FirstDelay);
        assert_eq!(s.next_deadline(), Some(61_000));

        s.advance_to(61_000);
        assert_eq!(s.stage(), Stage::Iti);
        assert_eq!(s.trial_num(), 1);

        // Pecks during the ITI are logged but do not count.
        s.handle_response(peck(Target::Stimulus), 62_000);
        assert_eq!(s.log().count(EventKind::ItiPeck), 1);

        s.advance_to(73_000);
        assert_eq!(s.current_substage(), Some(Substage::Blank));
        s.handle_response(peck(Target::Stimulus), 74_000);
        assert_eq!(s.log().count(EventKind::BackgroundPeck), 1);

        s.advance_to(83_000);
        assert_eq!(s.current_substage(), Some(Substage::StimulusActive));
        s.handle_response(peck(Target::Stimulus), 84_000);
        s.handle_response(peck(Target::Stimulus), 85_000);
        assert_eq!(s.stage(), Stage::Reinforcement);
        assert_eq!(s.log().count(EventKind::PretrainingKeyPeck), 2);
        assert_eq!(s.log().count(EventKind::ReinforcerProvided), 1);

        // The cancelled auto timer must not fire later.
        s.advance_to(90_000);
        assert_eq!(s.end_reason(), Some(EndReason::TrialsCompleted));
        assert_eq!(s.log().count(EventKind::AutoReinforcerProvided), 0);
        assert_eq!(s.log().count(EventKind::HopperClosed), 1);
        assert!(matches!(
            renderer.last(),
            Some(Screen::SessionEnded {
                reason: EndReason::TrialsCompleted
            })
        ));
    }

    #[test]
    fn auto_reinforcement_after_timeout() {
        let cfg = ExperimentConfig::default();
        let mut s = SessionController::with_plan(
            &cfg,
            setup("TEST", Phase::Pretraining),
            one_trial_plan(5),
            SessionContext::null(),
        )
        .unwrap();
        s.begin(0);
        // Test subject: immediate first ITI, 1 s ITI, 1 s trial delay.
        assert_eq!(s.stage(), Stage::Iti);
        s.advance_to(2_000);
        assert_eq!(s.current_substage(), Some(Substage::StimulusActive));
        s.handle_response(peck(Target::Stimulus), 3_000);
        s.advance_to(32_000);
        assert_eq!(s.stage(), Stage::Reinforcement);
        assert_eq!(s.stats().auto_reinforcements, 1);

        // Pecks into the hopper are logged as such and do not re-reinforce.
        s.handle_response(peck(Target::Stimulus), 32_500);
        assert_eq!(s.log().count(EventKind::HopperPeck), 1);
        assert_eq!(s.stats().reinforcements, 1);
    }

    #[test]
    fn abort_ends_once() {
        let cfg = ExperimentConfig::default();
        let sink = MemorySink::new();
        let ctx = SessionContext::new(crate::io::NullRenderer, crate::io::NullHopper, sink.clone());
        let mut s = SessionController::with_plan(
            &cfg,
            setup("TEST", Phase::Pretraining),
            one_trial_plan(5),
            ctx,
        )
        .unwrap();
        s.begin(0);
        s.abort(500);
        s.abort(600);
        assert_eq!(s.end_reason(), Some(EndReason::Aborted));
        assert_eq!(s.log().count(EventKind::SessionEnds), 1);
        assert!(s.next_deadline().is_none());
        assert_eq!(sink.len(), s.log().len());
        assert!(s.log().pending().is_empty());
    }

    #[test]
    fn records_carry_trial_columns() {
        let cfg = ExperimentConfig::default();
        let mut s = SessionController::with_plan(
            &cfg,
            setup("TEST", Phase::Pretraining),
            one_trial_plan(3),
            SessionContext::null(),
        )
        .unwrap();
        s.begin(0);
        s.advance_to(2_000);
        s.handle_response(Response::new(Target::Stimulus, 512.0, 580.0), 2_500);

        let r = s
            .log()
            .records()
            .iter()
            .find(|r| r.event == EventKind::PretrainingKeyPeck)
            .cloned()
            .unwrap();
        assert_eq!(r.trial_num, 1);
        assert_eq!(r.trial_type, Some("pretraining"));
        assert_eq!(r.center_stim.as_deref(), Some("control_circle"));
        assert_eq!(r.subphase2_ratio, Some(3));
        assert_eq!(r.subphase2_presses, Some(0));
        assert_eq!(r.substage, Some(2));
        assert_eq!(r.iti_ms, Some(1_000));
        // ITI 0..1000, trial delay 1000..2000.
        assert_eq!(r.trial_time_ms, Some(1_500));
        assert_eq!(r.substage_time_ms, Some(500));
        assert!((r.center_dist.unwrap() - 4.0).abs() < 1e-9);
    }
}
