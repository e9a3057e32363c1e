//! Error types for session setup and collaborator failures.
//!
//! Setup errors (`ConfigError`, `LoadError`, `GenerationError`) abort a
//! session before its first trial. `HardwareWarning` never aborts anything:
//! the controller logs it and carries on.

use std::path::PathBuf;

use thiserror::Error;

/// Stimulus source could not be read or failed validation.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read stimulus source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stimulus source is empty")]
    Empty,

    #[error("stimulus source header is missing column `{0}`")]
    MissingColumn(&'static str),

    #[error("line {line}: expected {expected} fields, found {found}")]
    RowWidth {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: column `{column}` is not a number: `{value}`")]
    NotNumeric {
        line: usize,
        column: &'static str,
        value: String,
    },

    #[error("line {line}: training set {value} is outside 0..=5")]
    TrainingSetOutOfRange { line: usize, value: u8 },

    #[error("line {line}: stimulus number {value} is outside 1..=5")]
    StimulusNumberOutOfRange { line: usize, value: u8 },

    #[error("duplicate stimulus name `{0}`")]
    DuplicateName(String),
}

/// Invalid or unreadable experiment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("subject `{0}` is not registered")]
    UnknownSubject(String),

    #[error("subject `{subject}` has counterbalancing group {group}; expected 1..=4")]
    InvalidGroup { subject: String, group: u8 },

    #[error("unknown experiment phase `{0}`")]
    UnknownPhase(String),

    #[error("invalid `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("config file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// The trial plan could not be built from the catalog.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("training set {class} has {available} stimuli in the session pool; {needed} required")]
    InsufficientClass {
        class: u8,
        available: usize,
        needed: usize,
    },

    #[error("probe with stimulus number {number} is not in the session pool")]
    MissingProbe { number: u8 },

    #[error("choice phase needs at least 2 stimuli, found {found}")]
    TooFewChoiceStimuli { found: usize },

    #[error("no ordering satisfies the repetition constraint after {attempts} attempts")]
    Unsatisfiable { attempts: usize },

    #[error("session stimulus pool is empty")]
    EmptyPool,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A collaborator (feeder, recorder) failed. Logged, never fatal.
#[derive(Debug, Clone, Error)]
#[error("{device}: {message}")]
pub struct HardwareWarning {
    pub device: &'static str,
    pub message: String,
}

impl HardwareWarning {
    pub fn new(device: &'static str, message: impl Into<String>) -> Self {
        Self {
            device,
            message: message.into(),
        }
    }
}

/// Anything that stops a session from being prepared.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}
