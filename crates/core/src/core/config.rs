//! Experiment configuration.
//!
//! Everything that varies between labs, boxes or subjects lives here and is
//! read from a JSON file. Every field has a default so a partial file is
//! enough; a missing file means "all defaults".

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::timer::Millis;

// ═══════════════════════════════════════════════════════════════════════════
// Phases
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pretraining,
    Autoshaping,
    Choice,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Pretraining, Phase::Autoshaping, Phase::Choice];

    /// Number written to the `ExpPhaseNum` column.
    pub fn number(self) -> u8 {
        match self {
            Phase::Pretraining => 0,
            Phase::Autoshaping => 1,
            Phase::Choice => 2,
        }
    }

    /// Name written to the `ExpPhaseName` column.
    pub fn display_name(self) -> &'static str {
        match self {
            Phase::Pretraining => "Pre-training",
            Phase::Autoshaping => "Autoshaping/Instrumental",
            Phase::Choice => "Choice Task",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pretraining => "pretraining",
            Phase::Autoshaping => "autoshaping",
            Phase::Choice => "choice",
        }
    }

    /// Whether trials present two keys and count left/right separately.
    pub fn is_two_alternative(self) -> bool {
        self == Phase::Choice
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "pretraining" | "pre-training" => Ok(Phase::Pretraining),
            "1" | "autoshaping" | "instrumental" => Ok(Phase::Autoshaping),
            "2" | "choice" => Ok(Phase::Choice),
            other => Err(ConfigError::UnknownPhase(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseParams {
    /// Trial limit checked at every ITI.
    pub max_trials: u32,
    /// Response requirement range (inclusive).
    pub ratio_min: u32,
    pub ratio_max: u32,
    /// ITI range in ms (inclusive).
    pub iti_min_ms: Millis,
    pub iti_max_ms: Millis,
    /// Auto-reinforcement timer for single-key phases.
    #[serde(default)]
    pub auto_reinforce_ms: Option<Millis>,
    /// Blank substage before the stimulus appears. `None` presents the keys
    /// immediately after the ITI.
    #[serde(default)]
    pub trial_delay_ms: Option<Millis>,
    /// Pecks on the terminal-link key after a choice, drawn per trial.
    /// `None` disables the terminal link.
    #[serde(default)]
    pub terminal_link: Option<RatioRange>,
}

/// Inclusive response-requirement range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatioRange {
    pub min: u32,
    pub max: u32,
}

impl RatioRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// RR10 terminal link of the legacy choice procedure (7..=12).
    pub fn terminal_link() -> Self {
        Self::new(7, 12)
    }
}

impl PhaseParams {
    pub fn pretraining() -> Self {
        Self {
            max_trials: 90,
            ratio_min: 3,
            ratio_max: 7,
            iti_min_ms: 10_000,
            iti_max_ms: 20_000,
            auto_reinforce_ms: Some(30_000),
            trial_delay_ms: Some(10_000),
            terminal_link: None,
        }
    }

    pub fn autoshaping() -> Self {
        Self {
            max_trials: 84,
            ratio_min: 7,
            ratio_max: 12,
            ..Self::pretraining()
        }
    }

    pub fn choice() -> Self {
        Self {
            max_trials: 84,
            ratio_min: 10,
            ratio_max: 10,
            iti_min_ms: 20_000,
            iti_max_ms: 20_000,
            auto_reinforce_ms: None,
            trial_delay_ms: None,
            terminal_link: None,
        }
    }

    fn validate(&self, key: &'static str) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { key, reason });
        if self.max_trials == 0 {
            return invalid("max_trials must be at least 1".into());
        }
        if self.ratio_min == 0 || self.ratio_min > self.ratio_max {
            return invalid(format!(
                "ratio range {}..={} is empty or starts at 0",
                self.ratio_min, self.ratio_max
            ));
        }
        if self.iti_min_ms > self.iti_max_ms {
            return invalid(format!(
                "ITI range {}..={} ms is empty",
                self.iti_min_ms, self.iti_max_ms
            ));
        }
        if let Some(tl) = self.terminal_link {
            if tl.min == 0 || tl.min > tl.max {
                return invalid(format!(
                    "terminal link range {}..={} is empty or starts at 0",
                    tl.min, tl.max
                ));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Trial design
// ═══════════════════════════════════════════════════════════════════════════

fn default_palette() -> Vec<String> {
    ["#77FF00", "#FF8100", "#D5869D", "#902090", "#FF1100", "#6B4330"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_stimulus_numbers() -> Vec<u8> {
    vec![1, 5]
}

fn default_comparison_class() -> u8 {
    5
}

fn default_gap_sizes() -> Vec<u32> {
    vec![4, 5, 6, 7]
}

fn default_trailing_gap() -> u32 {
    2
}

fn default_max_shuffle_attempts() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignParams {
    /// Stimulus numbers that make up the autoshaping pool.
    #[serde(default = "default_stimulus_numbers")]
    pub autoshaping_stimulus_numbers: Vec<u8>,
    /// Stimulus numbers used for the choice-phase comparisons.
    #[serde(default = "default_stimulus_numbers")]
    pub choice_stimulus_numbers: Vec<u8>,
    /// Training class compared against the probes in the choice phase.
    #[serde(default = "default_comparison_class")]
    pub comparison_class: u8,
    #[serde(default = "default_palette")]
    pub sbe_palette: Vec<String>,
    /// SBE run lengths between free-choice trials, cycled to one gap per
    /// permutation and shuffled.
    #[serde(default = "default_gap_sizes")]
    pub gap_sizes: Vec<u32>,
    /// SBE trials after the last free-choice trial.
    #[serde(default = "default_trailing_gap")]
    pub trailing_gap: u32,
    #[serde(default = "default_max_shuffle_attempts")]
    pub max_shuffle_attempts: usize,
    /// Keep consecutive free-choice trials from sharing a stimulus.
    #[serde(default)]
    pub separate_free_choice_stimuli: bool,
}

impl Default for DesignParams {
    fn default() -> Self {
        Self {
            autoshaping_stimulus_numbers: default_stimulus_numbers(),
            choice_stimulus_numbers: default_stimulus_numbers(),
            comparison_class: default_comparison_class(),
            sbe_palette: default_palette(),
            gap_sizes: default_gap_sizes(),
            trailing_gap: default_trailing_gap(),
            max_shuffle_attempts: default_max_shuffle_attempts(),
            separate_free_choice_stimuli: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Timing
// ═══════════════════════════════════════════════════════════════════════════

fn default_first_iti_ms() -> Millis {
    60_000
}
fn default_hopper_ms() -> Millis {
    5_000
}
fn default_correction_timeout_ms() -> Millis {
    5_000
}
fn default_video_lead_ms() -> Millis {
    3_000
}
fn default_test_iti_ms() -> Millis {
    1_000
}
fn default_test_hopper_ms() -> Millis {
    2_000
}
fn default_test_trial_delay_ms() -> Millis {
    1_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingParams {
    /// Delay between "subject is in the box" and the first ITI.
    #[serde(default = "default_first_iti_ms")]
    pub first_iti_ms: Millis,
    #[serde(default = "default_hopper_ms")]
    pub hopper_ms: Millis,
    #[serde(default = "default_correction_timeout_ms")]
    pub correction_timeout_ms: Millis,
    /// Choice-phase recording starts this long before the ITI ends.
    #[serde(default = "default_video_lead_ms")]
    pub video_lead_ms: Millis,

    // Test-subject overrides
    #[serde(default = "default_test_iti_ms")]
    pub test_iti_ms: Millis,
    #[serde(default = "default_test_hopper_ms")]
    pub test_hopper_ms: Millis,
    #[serde(default = "default_test_trial_delay_ms")]
    pub test_trial_delay_ms: Millis,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            first_iti_ms: default_first_iti_ms(),
            hopper_ms: default_hopper_ms(),
            correction_timeout_ms: default_correction_timeout_ms(),
            video_lead_ms: default_video_lead_ms(),
            test_iti_ms: default_test_iti_ms(),
            test_hopper_ms: default_test_hopper_ms(),
            test_trial_delay_ms: default_test_trial_delay_ms(),
        }
    }
}

/// Key centres in screen pixels, used for the peck distance columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyLayout {
    pub center: [f64; 2],
    pub left: [f64; 2],
    pub right: [f64; 2],
    pub terminal_link: [f64; 2],
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            center: [512.0, 584.0],
            left: [211.5, 374.0],
            right: [812.5, 374.0],
            terminal_link: [500.5, 366.5],
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Subjects
// ═══════════════════════════════════════════════════════════════════════════

/// Counterbalancing group (1..=4). Decides the order probes first appear in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterbalanceGroup(u8);

impl CounterbalanceGroup {
    pub fn new(group: u8) -> Option<Self> {
        (1..=4).contains(&group).then_some(Self(group))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Probe stimulus numbers in presentation order.
    pub fn probe_order(self) -> [u8; 5] {
        match self.0 {
            1 => [1, 5, 2, 3, 4],
            2 => [1, 5, 4, 3, 2],
            3 => [5, 1, 2, 3, 4],
            _ => [5, 1, 4, 3, 2],
        }
    }

    /// The two probes that close the first two opening blocks.
    pub fn bookends(self) -> [u8; 2] {
        let order = self.probe_order();
        [order[0], order[1]]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub group: u8,
    /// Test subjects run with short timers.
    #[serde(default)]
    pub test: bool,
}

/// Subject name → profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectRegistry(HashMap<String, SubjectProfile>);

impl Default for SubjectRegistry {
    fn default() -> Self {
        let mut subjects = HashMap::new();
        subjects.insert(
            "TEST".to_string(),
            SubjectProfile {
                group: 1,
                test: true,
            },
        );
        Self(subjects)
    }
}

impl SubjectRegistry {
    pub fn insert(&mut self, name: impl Into<String>, profile: SubjectProfile) {
        self.0.insert(name.into(), profile);
    }

    pub fn get(&self, name: &str) -> Option<&SubjectProfile> {
        self.0.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.0.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn resolve(&self, name: &str) -> Result<(CounterbalanceGroup, &SubjectProfile), ConfigError> {
        let profile = self
            .0
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSubject(name.to_string()))?;
        let group = CounterbalanceGroup::new(profile.group).ok_or_else(|| {
            ConfigError::InvalidGroup {
                subject: name.to_string(),
                group: profile.group,
            }
        })?;
        Ok((group, profile))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Top level
// ═══════════════════════════════════════════════════════════════════════════

fn default_stimuli_path() -> PathBuf {
    PathBuf::from("stimuli/stimulus_assignments.csv")
}

fn default_session_limit_minutes() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub subjects: SubjectRegistry,
    /// Stimulus assignments CSV. A missing file falls back to the built-in
    /// gradient set.
    #[serde(default = "default_stimuli_path")]
    pub stimuli_path: PathBuf,
    #[serde(default = "PhaseParams::pretraining")]
    pub pretraining: PhaseParams,
    #[serde(default = "PhaseParams::autoshaping")]
    pub autoshaping: PhaseParams,
    #[serde(default = "PhaseParams::choice")]
    pub choice: PhaseParams,
    #[serde(default)]
    pub design: DesignParams,
    #[serde(default)]
    pub timing: TimingParams,
    #[serde(default)]
    pub layout: KeyLayout,
    #[serde(default = "default_session_limit_minutes")]
    pub session_limit_minutes: u64,
    #[serde(default)]
    pub record_video: bool,
    #[serde(default = "default_true")]
    pub record_data: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            subjects: SubjectRegistry::default(),
            stimuli_path: default_stimuli_path(),
            pretraining: PhaseParams::pretraining(),
            autoshaping: PhaseParams::autoshaping(),
            choice: PhaseParams::choice(),
            design: DesignParams::default(),
            timing: TimingParams::default(),
            layout: KeyLayout::default(),
            session_limit_minutes: default_session_limit_minutes(),
            record_video: false,
            record_data: true,
        }
    }
}

impl ExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_err = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let cfg: Self = serde_json::from_str(&text).map_err(|e| file_err(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let file_err = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let text = serde_json::to_string_pretty(self).map_err(|e| file_err(e.to_string()))?;
        fs::write(path, text).map_err(|e| file_err(e.to_string()))
    }

    pub fn phase(&self, phase: Phase) -> &PhaseParams {
        match phase {
            Phase::Pretraining => &self.pretraining,
            Phase::Autoshaping => &self.autoshaping,
            Phase::Choice => &self.choice,
        }
    }

    pub fn session_limit_ms(&self) -> Millis {
        self.session_limit_minutes.saturating_mul(60_000)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pretraining.validate("pretraining")?;
        self.autoshaping.validate("autoshaping")?;
        self.choice.validate("choice")?;

        let d = &self.design;
        if d.sbe_palette.len() < 2 {
            return Err(ConfigError::Invalid {
                key: "design.sbe_palette",
                reason: "needs at least two colours".into(),
            });
        }
        if d.gap_sizes.is_empty() {
            return Err(ConfigError::Invalid {
                key: "design.gap_sizes",
                reason: "must not be empty".into(),
            });
        }
        if d.max_shuffle_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "design.max_shuffle_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if d.autoshaping_stimulus_numbers.is_empty() || d.choice_stimulus_numbers.is_empty() {
            return Err(ConfigError::Invalid {
                key: "design",
                reason: "stimulus number sets must not be empty".into(),
            });
        }
        if !(1..=5).contains(&d.comparison_class) {
            return Err(ConfigError::Invalid {
                key: "design.comparison_class",
                reason: format!("{} is outside 1..=5", d.comparison_class),
            });
        }
        if self.session_limit_minutes == 0 {
            return Err(ConfigError::Invalid {
                key: "session_limit_minutes",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
