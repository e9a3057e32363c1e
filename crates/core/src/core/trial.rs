//! Trial descriptors and the session plan.

use serde::{Deserialize, Serialize};

use crate::catalog::Stimulus;
use crate::config::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Free-choice comparison type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChoiceKind {
    /// Probe versus probe.
    PvP,
    /// Probe versus control.
    PvC,
    /// Control versus control (same training class).
    CvC,
}

impl ChoiceKind {
    pub fn classify(left: &Stimulus, right: &Stimulus) -> Self {
        if left.is_probe() && right.is_probe() {
            ChoiceKind::PvP
        } else if left.training_set == right.training_set {
            ChoiceKind::CvC
        } else {
            ChoiceKind::PvC
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChoiceKind::PvP => "PvP",
            ChoiceKind::PvC => "PvC",
            ChoiceKind::CvC => "CvC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "choice", rename_all = "snake_case")]
pub enum TrialKind {
    Pretraining,
    AutoshapingControl,
    AutoshapingProbe,
    SideBiasElimination,
    FreeChoice(ChoiceKind),
}

impl TrialKind {
    /// Label written to the `TrialType` column.
    pub fn label(self) -> &'static str {
        match self {
            TrialKind::Pretraining => "pretraining",
            TrialKind::AutoshapingControl => "control",
            TrialKind::AutoshapingProbe => "probe",
            TrialKind::SideBiasElimination => "SBE_trial",
            TrialKind::FreeChoice(c) => c.label(),
        }
    }

    pub fn is_two_alternative(self) -> bool {
        matches!(
            self,
            TrialKind::SideBiasElimination | TrialKind::FreeChoice(_)
        )
    }
}

/// What the renderer puts on the keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Plain pretraining key.
    None,
    Single { stimulus: Stimulus },
    Pair { left: Stimulus, right: Stimulus },
    /// Solid-colour keys (`#RRGGBB`).
    Colors { left: String, right: String },
}

impl Payload {
    pub fn center(&self) -> Option<&Stimulus> {
        match self {
            Payload::Single { stimulus } => Some(stimulus),
            _ => None,
        }
    }

    pub fn left(&self) -> Option<&Stimulus> {
        match self {
            Payload::Pair { left, .. } => Some(left),
            _ => None,
        }
    }

    pub fn right(&self) -> Option<&Stimulus> {
        match self {
            Payload::Pair { right, .. } => Some(right),
            _ => None,
        }
    }

    pub fn colors(&self) -> Option<(&str, &str)> {
        match self {
            Payload::Colors { left, right } => Some((left, right)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialDescriptor {
    /// 1-based position in the plan.
    pub index: u32,
    pub kind: TrialKind,
    pub payload: Payload,
    /// Pecks required to complete the response requirement.
    pub ratio: u32,
    /// Only set for side-bias-elimination trials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_side: Option<Side>,
    /// Terminal-link pecks after a completed choice, when the phase has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_link_ratio: Option<u32>,
}

/// The ordered, immutable trial list for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialPlan {
    pub phase: Phase,
    pub seed: u64,
    pub group: u8,
    pub trials: Vec<TrialDescriptor>,
}

impl TrialPlan {
    /// Descriptor for a 1-based trial index.
    pub fn get(&self, index: u32) -> Option<&TrialDescriptor> {
        let i = usize::try_from(index).ok()?.checked_sub(1)?;
        self.trials.get(i)
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrialDescriptor> {
        self.trials.iter()
    }

    pub fn count_kind(&self, kind: TrialKind) -> usize {
        self.trials.iter().filter(|t| t.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_pairs() {
        let p1 = Stimulus::new("Probe1.jpg", 0, 1);
        let p5 = Stimulus::new("Probe5.jpg", 0, 5);
        let c1 = Stimulus::new("Set5_Stim1.jpg", 5, 1);
        let c5 = Stimulus::new("Set5_Stim5.jpg", 5, 5);
        assert_eq!(ChoiceKind::classify(&p1, &p5), ChoiceKind::PvP);
        assert_eq!(ChoiceKind::classify(&c1, &c5), ChoiceKind::CvC);
        assert_eq!(ChoiceKind::classify(&p1, &c5), ChoiceKind::PvC);
        assert_eq!(ChoiceKind::classify(&c1, &p5), ChoiceKind::PvC);
    }

    #[test]
    fn plan_lookup_is_one_based() {
        let plan = TrialPlan {
            phase: Phase::Pretraining,
            seed: 1,
            group: 1,
            trials: vec![TrialDescriptor {
                index: 1,
                kind: TrialKind::Pretraining,
                payload: Payload::None,
                ratio: 3,
                correct_side: None,
                terminal_link_ratio: None,
            }],
        };
        assert!(plan.get(0).is_none());
        assert_eq!(plan.get(1).map(|t| t.ratio), Some(3));
        assert!(plan.get(2).is_none());
    }

    #[test]
    fn kind_labels() {
        assert_eq!(TrialKind::SideBiasElimination.label(), "SBE_trial");
        assert_eq!(TrialKind::FreeChoice(ChoiceKind::PvC).label(), "PvC");
        assert!(!TrialKind::AutoshapingProbe.is_two_alternative());
    }
}
