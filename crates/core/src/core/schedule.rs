//! Per-trial reinforcement schedule.
//!
//! A `ScheduleEngine` owns one trial attempt: it counts qualifying pecks
//! against the response requirement and decides the outcome. It does not
//! know about time beyond the anchors it is handed; the session controller
//! owns every timer, including the auto-reinforcement one.

use serde::{Deserialize, Serialize};

use crate::timer::Millis;
use crate::trial::{Side, TrialDescriptor, TrialKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substage {
    /// Keys dark; trial delay running.
    Blank,
    /// Keys lit and receptive.
    StimulusActive,
    /// Choice made; waiting on the terminal-link key.
    TerminalLink,
}

/// What a touch landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Background,
    /// The centre key (pretraining key or autoshaping image).
    Stimulus,
    Left,
    Right,
    TerminalLink,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Background => "background",
            Target::Stimulus => "stimulus",
            Target::Left => "left",
            Target::Right => "right",
            Target::TerminalLink => "terminal_link",
        }
    }

    /// Accepts the `as_str` names plus a few operator shorthands.
    pub fn parse(name: &str) -> Option<Target> {
        match name.trim().to_ascii_lowercase().as_str() {
            "background" | "bg" => Some(Target::Background),
            "stimulus" | "center" | "centre" | "key" => Some(Target::Stimulus),
            "left" | "l" => Some(Target::Left),
            "right" | "r" => Some(Target::Right),
            "terminal_link" | "terminal" | "tl" => Some(Target::TerminalLink),
            _ => None,
        }
    }
}

/// A touch reported by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub target: Target,
    pub x: f64,
    pub y: f64,
}

impl Response {
    pub fn new(target: Target, x: f64, y: f64) -> Self {
        Self { target, x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinforcementCause {
    Ratio,
    AutoTimer,
    CorrectChoice,
    /// Terminal link completed after a choice; food on every choice trial.
    TerminalLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrialOutcome {
    Reinforced {
        cause: ReinforcementCause,
        choice: Option<Side>,
    },
    FreeChoice {
        choice: Side,
    },
    /// Wrong side on a side-bias-elimination trial.
    CorrectionTimeout {
        choice: Side,
    },
}

/// Result of feeding one response to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Not a qualifying response in the current substage.
    None,
    /// Qualifying response, requirement not yet met.
    Counted { count: u32 },
    /// Choice requirement met; terminal link now active.
    EnteredTerminalLink { choice: Side },
    Resolved(TrialOutcome),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialState {
    pub substage: Substage,
    pub center_count: u32,
    pub left_count: u32,
    pub right_count: u32,
    pub terminal_count: u32,
    /// This attempt repeats a trial after an incorrect choice.
    pub correction: bool,
    /// ITI start of this trial.
    pub trial_started_at: Millis,
    pub substage_started_at: Millis,
}

#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    descriptor: TrialDescriptor,
    state: TrialState,
    /// Side chosen before the terminal link.
    chosen: Option<Side>,
    outcome: Option<TrialOutcome>,
}

impl ScheduleEngine {
    pub fn new(descriptor: TrialDescriptor, correction: bool, now: Millis) -> Self {
        Self {
            descriptor,
            state: TrialState {
                substage: Substage::Blank,
                center_count: 0,
                left_count: 0,
                right_count: 0,
                terminal_count: 0,
                correction,
                trial_started_at: now,
                substage_started_at: now,
            },
            chosen: None,
            outcome: None,
        }
    }

    pub fn descriptor(&self) -> &TrialDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> &TrialState {
        &self.state
    }

    pub fn substage(&self) -> Substage {
        self.state.substage
    }

    pub fn outcome(&self) -> Option<TrialOutcome> {
        self.outcome
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn terminal_link_ratio(&self) -> Option<u32> {
        self.descriptor.terminal_link_ratio
    }

    pub fn is_two_alternative(&self) -> bool {
        self.descriptor.kind.is_two_alternative()
    }

    /// Value for the `TrialSubStage` column: 1 for the first response
    /// phase of the trial, 2 for the second.
    pub fn substage_number(&self) -> u8 {
        match (self.state.substage, self.is_two_alternative()) {
            (Substage::Blank, _) => 1,
            (Substage::StimulusActive, true) => 1,
            (Substage::StimulusActive, false) => 2,
            (Substage::TerminalLink, _) => 2,
        }
    }

    /// Light the keys.
    pub fn present(&mut self, now: Millis) {
        if self.outcome.is_none() && self.state.substage == Substage::Blank {
            self.state.substage = Substage::StimulusActive;
            self.state.substage_started_at = now;
        }
    }

    pub fn handle(&mut self, target: Target, now: Millis) -> Transition {
        if self.outcome.is_some() {
            return Transition::None;
        }
        match self.state.substage {
            Substage::Blank => Transition::None,
            Substage::StimulusActive if self.is_two_alternative() => {
                self.handle_choice(target, now)
            }
            Substage::StimulusActive => {
                if target != Target::Stimulus {
                    return Transition::None;
                }
                self.state.center_count += 1;
                if self.state.center_count >= self.descriptor.ratio {
                    self.resolve(TrialOutcome::Reinforced {
                        cause: ReinforcementCause::Ratio,
                        choice: None,
                    })
                } else {
                    Transition::Counted {
                        count: self.state.center_count,
                    }
                }
            }
            Substage::TerminalLink => {
                if target != Target::TerminalLink {
                    return Transition::None;
                }
                self.state.terminal_count += 1;
                let required = self.terminal_link_ratio().unwrap_or(1);
                if self.state.terminal_count < required {
                    return Transition::Counted {
                        count: self.state.terminal_count,
                    };
                }
                self.resolve(TrialOutcome::Reinforced {
                    cause: ReinforcementCause::TerminalLink,
                    choice: self.chosen,
                })
            }
        }
    }

    fn handle_choice(&mut self, target: Target, now: Millis) -> Transition {
        let (side, count) = match target {
            Target::Left => {
                self.state.left_count += 1;
                (Side::Left, self.state.left_count)
            }
            Target::Right => {
                self.state.right_count += 1;
                (Side::Right, self.state.right_count)
            }
            _ => return Transition::None,
        };
        if count < self.descriptor.ratio {
            return Transition::Counted { count };
        }

        let outcome = match (self.descriptor.kind, self.descriptor.correct_side) {
            (TrialKind::SideBiasElimination, Some(correct)) if correct != side => {
                return self.resolve(TrialOutcome::CorrectionTimeout { choice: side });
            }
            (TrialKind::SideBiasElimination, _) => TrialOutcome::Reinforced {
                cause: ReinforcementCause::CorrectChoice,
                choice: Some(side),
            },
            _ => TrialOutcome::FreeChoice { choice: side },
        };

        if self.terminal_link_ratio().is_some() {
            self.chosen = Some(side);
            self.state.substage = Substage::TerminalLink;
            self.state.substage_started_at = now;
            Transition::EnteredTerminalLink { choice: side }
        } else {
            self.resolve(outcome)
        }
    }

    /// The auto-reinforcement timer fired. Ignored once the trial resolved
    /// and on two-key trials.
    pub fn auto_reinforce(&mut self) -> Option<TrialOutcome> {
        if self.outcome.is_some()
            || self.is_two_alternative()
            || self.state.substage != Substage::StimulusActive
        {
            return None;
        }
        let outcome = TrialOutcome::Reinforced {
            cause: ReinforcementCause::AutoTimer,
            choice: None,
        };
        self.outcome = Some(outcome);
        Some(outcome)
    }

    /// Flag the attempt as a correction from the incorrect choice onwards.
    pub fn mark_correction(&mut self) {
        self.state.correction = true;
    }

    /// Reset for another attempt at the same descriptor after a correction
    /// timeout.
    pub fn restart_for_correction(&mut self, now: Millis) {
        self.state.substage = Substage::Blank;
        self.state.center_count = 0;
        self.state.left_count = 0;
        self.state.right_count = 0;
        self.state.terminal_count = 0;
        self.state.correction = true;
        self.state.substage_started_at = now;
        self.chosen = None;
        self.outcome = None;
    }

    fn resolve(&mut self, outcome: TrialOutcome) -> Transition {
        self.outcome = Some(outcome);
        Transition::Resolved(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Stimulus;
    use crate::trial::{ChoiceKind, Payload};

    fn single(ratio: u32) -> TrialDescriptor {
        TrialDescriptor {
            index: 1,
            kind: TrialKind::AutoshapingControl,
            payload: Payload::Single {
                stimulus: Stimulus::new("Set1_Stim1.jpg", 1, 1),
            },
            ratio,
            correct_side: None,
            terminal_link_ratio: None,
        }
    }

    fn sbe(correct: Side) -> TrialDescriptor {
        TrialDescriptor {
            index: 3,
            kind: TrialKind::SideBiasElimination,
            payload: Payload::Colors {
                left: "#77FF00".into(),
                right: "#FF8100".into(),
            },
            ratio: 2,
            correct_side: Some(correct),
            terminal_link_ratio: None,
        }
    }

    fn free() -> TrialDescriptor {
        TrialDescriptor {
            index: 5,
            kind: TrialKind::FreeChoice(ChoiceKind::PvP),
            payload: Payload::Pair {
                left: Stimulus::new("Probe1.jpg", 0, 1),
                right: Stimulus::new("Probe5.jpg", 0, 5),
            },
            ratio: 2,
            correct_side: None,
            terminal_link_ratio: None,
        }
    }

    fn with_terminal_link(mut d: TrialDescriptor, ratio: u32) -> TrialDescriptor {
        d.terminal_link_ratio = Some(ratio);
        d
    }

    #[test]
    fn blank_substage_ignores_pecks() {
        let mut e = ScheduleEngine::new(single(1), false, 0);
        assert_eq!(e.handle(Target::Stimulus, 5), Transition::None);
        assert_eq!(e.state().center_count, 0);
        e.present(10);
        assert_eq!(e.state().substage_started_at, 10);
        assert!(matches!(e.handle(Target::Stimulus, 11), Transition::Resolved(_)));
    }

    #[test]
    fn ratio_completion_reinforces_once() {
        let mut e = ScheduleEngine::new(single(3), false, 0);
        e.present(0);
        assert_eq!(e.handle(Target::Background, 1), Transition::None);
        assert_eq!(e.handle(Target::Stimulus, 2), Transition::Counted { count: 1 });
        assert_eq!(e.handle(Target::Stimulus, 3), Transition::Counted { count: 2 });
        assert_eq!(
            e.handle(Target::Stimulus, 4),
            Transition::Resolved(TrialOutcome::Reinforced {
                cause: ReinforcementCause::Ratio,
                choice: None
            })
        );
        assert_eq!(e.handle(Target::Stimulus, 5), Transition::None);
        assert_eq!(e.auto_reinforce(), None);
    }

    #[test]
    fn auto_timer_then_late_pecks_are_ignored() {
        let mut e = ScheduleEngine::new(single(5), false, 0);
        e.present(0);
        e.handle(Target::Stimulus, 1);
        assert_eq!(
            e.auto_reinforce(),
            Some(TrialOutcome::Reinforced {
                cause: ReinforcementCause::AutoTimer,
                choice: None
            })
        );
        assert_eq!(e.handle(Target::Stimulus, 2), Transition::None);
        assert_eq!(e.auto_reinforce(), None);
    }

    #[test]
    fn sbe_correct_and_incorrect() {
        let mut e = ScheduleEngine::new(sbe(Side::Left), false, 0);
        e.present(0);
        assert_eq!(e.substage_number(), 1);
        e.handle(Target::Right, 1);
        e.handle(Target::Left, 2);
        assert_eq!(
            e.handle(Target::Left, 3),
            Transition::Resolved(TrialOutcome::Reinforced {
                cause: ReinforcementCause::CorrectChoice,
                choice: Some(Side::Left)
            })
        );

        let mut e = ScheduleEngine::new(sbe(Side::Left), false, 0);
        e.present(0);
        e.handle(Target::Right, 1);
        assert_eq!(
            e.handle(Target::Right, 2),
            Transition::Resolved(TrialOutcome::CorrectionTimeout { choice: Side::Right })
        );
    }

    #[test]
    fn correction_restart_resets_counts() {
        let mut e = ScheduleEngine::new(sbe(Side::Right), false, 0);
        e.present(0);
        e.handle(Target::Left, 1);
        e.handle(Target::Left, 2);
        assert!(e.is_resolved());

        e.mark_correction();
        assert!(e.state().correction);
        assert!(e.is_resolved());
        e.restart_for_correction(7_000);
        let s = e.state();
        assert!(s.correction);
        assert_eq!((s.left_count, s.right_count), (0, 0));
        assert_eq!(s.substage, Substage::Blank);
        assert_eq!(s.trial_started_at, 0);
        assert!(!e.is_resolved());

        e.present(7_000);
        e.handle(Target::Right, 7_100);
        assert!(matches!(
            e.handle(Target::Right, 7_200),
            Transition::Resolved(TrialOutcome::Reinforced { .. })
        ));
    }

    #[test]
    fn free_choice_and_auto_timer_does_not_apply() {
        let mut e = ScheduleEngine::new(free(), false, 0);
        e.present(0);
        assert_eq!(e.auto_reinforce(), None);
        e.handle(Target::Stimulus, 1);
        e.handle(Target::Right, 2);
        assert_eq!(
            e.handle(Target::Right, 3),
            Transition::Resolved(TrialOutcome::FreeChoice { choice: Side::Right })
        );
    }

    #[test]
    fn terminal_link_reinforces_free_choice() {
        let mut e = ScheduleEngine::new(with_terminal_link(free(), 2), false, 0);
        e.present(0);
        e.handle(Target::Left, 1);
        assert_eq!(
            e.handle(Target::Left, 2),
            Transition::EnteredTerminalLink { choice: Side::Left }
        );
        assert_eq!(e.substage(), Substage::TerminalLink);
        assert_eq!(e.substage_number(), 2);
        assert_eq!(e.handle(Target::Left, 3), Transition::None);
        assert_eq!(e.handle(Target::TerminalLink, 4), Transition::Counted { count: 1 });
        assert_eq!(
            e.handle(Target::TerminalLink, 5),
            Transition::Resolved(TrialOutcome::Reinforced {
                cause: ReinforcementCause::TerminalLink,
                choice: Some(Side::Left)
            })
        );
        assert_eq!(e.handle(Target::TerminalLink, 6), Transition::None);
    }

    #[test]
    fn terminal_link_after_correct_sbe() {
        let mut e = ScheduleEngine::new(with_terminal_link(sbe(Side::Right), 1), false, 0);
        e.present(0);
        e.handle(Target::Right, 1);
        assert_eq!(
            e.handle(Target::Right, 2),
            Transition::EnteredTerminalLink { choice: Side::Right }
        );
        assert_eq!(
            e.handle(Target::TerminalLink, 3),
            Transition::Resolved(TrialOutcome::Reinforced {
                cause: ReinforcementCause::TerminalLink,
                choice: Some(Side::Right)
            })
        );
    }

    #[test]
    fn terminal_link_skipped_for_incorrect_sbe() {
        let mut e = ScheduleEngine::new(with_terminal_link(sbe(Side::Left), 3), false, 0);
        e.present(0);
        e.handle(Target::Right, 1);
        assert!(matches!(
            e.handle(Target::Right, 2),
            Transition::Resolved(TrialOutcome::CorrectionTimeout { .. })
        ));
    }

    #[test]
    fn target_names() {
        for t in [
            Target::Background,
            Target::Stimulus,
            Target::Left,
            Target::Right,
            Target::TerminalLink,
        ] {
            assert_eq!(Target::parse(t.as_str()), Some(t));
        }
        assert_eq!(Target::parse(" Centre "), Some(Target::Stimulus));
        assert_eq!(Target::parse("hopper"), None);
    }
}
