//! Running tallies of a session: reinforcements, choices and the recent
//! reinforcement rate shown on the operator status line.

use serde::{Deserialize, Serialize};

use crate::trial::Side;

/// Size of the rolling reinforcement window.
const RECENT_WINDOW: usize = 200;

/// Running tallies for the operator's status display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub itis: u32,
    pub trials_presented: u32,
    pub reinforcements: u32,
    pub auto_reinforcements: u32,
    pub corrections: u32,
    pub free_choice_left: u32,
    pub free_choice_right: u32,
    pub sbe_correct: u32,
    pub sbe_incorrect: u32,
    pub pecks: u32,
    /// Per resolved attempt: did it earn food?
    pub recent: Vec<bool>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            recent: Vec::with_capacity(RECENT_WINDOW),
            ..Self::default()
        }
    }

    fn push_recent(&mut self, reinforced: bool) {
        self.recent.push(reinforced);
        if self.recent.len() > RECENT_WINDOW {
            self.recent.remove(0);
        }
    }

    pub fn record_reinforcement(&mut self, auto: bool) {
        self.reinforcements += 1;
        if auto {
            self.auto_reinforcements += 1;
        }
        self.push_recent(true);
    }

    pub fn record_sbe(&mut self, correct: bool) {
        if correct {
            self.sbe_correct += 1;
        } else {
            self.sbe_incorrect += 1;
            self.corrections += 1;
            self.push_recent(false);
        }
    }

    /// `fed` free choices are followed by a terminal-link reinforcement,
    /// which fills the rolling window instead.
    pub fn record_free_choice(&mut self, side: Side, fed: bool) {
        match side {
            Side::Left => self.free_choice_left += 1,
            Side::Right => self.free_choice_right += 1,
        }
        if !fed {
            self.push_recent(false);
        }
    }

    pub fn sbe_accuracy(&self) -> f32 {
        let total = self.sbe_correct + self.sbe_incorrect;
        if total == 0 {
            0.5
        } else {
            self.sbe_correct as f32 / total as f32
        }
    }

    /// Share of recent attempts that ended in food.
    pub fn recent_rate(&self) -> f32 {
        if self.recent.is_empty() {
            return 0.5;
        }
        let hits = self.recent.iter().filter(|&&x| x).count();
        hits as f32 / self.recent.len() as f32
    }

    /// Free-choice left share minus 0.5; positive means a left bias.
    pub fn side_bias(&self) -> f32 {
        let total = self.free_choice_left + self.free_choice_right;
        if total == 0 {
            0.0
        } else {
            self.free_choice_left as f32 / total as f32 - 0.5
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_default_to_chance() {
        let s = SessionStats::new();
        assert_eq!(s.sbe_accuracy(), 0.5);
        assert_eq!(s.recent_rate(), 0.5);
        assert_eq!(s.side_bias(), 0.0);
    }

    #[test]
    fn tallies() {
        let mut s = SessionStats::new();
        s.record_reinforcement(false);
        s.record_reinforcement(true);
        s.record_sbe(true);
        s.record_sbe(false);
        s.record_free_choice(Side::Left, false);
        s.record_free_choice(Side::Left, false);
        s.record_free_choice(Side::Right, false);

        assert_eq!(s.reinforcements, 2);
        assert_eq!(s.auto_reinforcements, 1);
        assert_eq!(s.corrections, 1);
        assert_eq!(s.sbe_accuracy(), 0.5);
        assert!((s.side_bias() - (2.0 / 3.0 - 0.5)).abs() < 1e-6);
    }

    #[test]
    fn recent_window_is_bounded() {
        let mut s = SessionStats::new();
        for _ in 0..250 {
            s.record_reinforcement(false);
        }
        s.record_free_choice(Side::Right, false);
        assert_eq!(s.recent.len(), 200);
        assert!((s.recent_rate() - 199.0 / 200.0).abs() < 1e-6);
    }

    #[test]
    fn fed_free_choice_counts_once_in_window() {
        let mut s = SessionStats::new();
        s.record_free_choice(Side::Left, true);
        s.record_reinforcement(false);
        assert_eq!(s.free_choice_left, 1);
        assert_eq!(s.recent, vec![true]);
    }
}
