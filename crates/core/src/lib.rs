//! # operant
//!
//! Trial sequencing and reinforcement scheduling for touchscreen operant
//! experiments (pretraining, mixed autoshaping/instrumental training and a
//! preferential-choice task).
//!
//! The core is a single-threaded state machine on a logical millisecond
//! clock. It never sleeps and never touches hardware directly: rendering,
//! the feeder, video and persistence sit behind the traits in [`io`].
//!
//! ## Quick Start
//!
//! ```
//! use operant::prelude::*;
//!
//! let config = ExperimentConfig::default();
//! let catalog = Catalog::builtin_gradient_set();
//! let setup = SessionSetup {
//!     subject: "TEST".to_string(),
//!     phase: Phase::Pretraining,
//!     seed: 7,
//!     started_at: chrono::Local::now().naive_local(),
//!     record_video: false,
//! };
//!
//! let mut session =
//!     SessionController::prepare(&config, &catalog, setup, SessionContext::null()).unwrap();
//! session.begin(0);
//!
//! // Peck whenever the key is lit, otherwise sleep until the next timer.
//! while let Some(deadline) = session.next_deadline() {
//!     if session.current_substage() == Some(Substage::StimulusActive) {
//!         let now = session.now() + 500;
//!         session.handle_response(Response::new(Target::Stimulus, 512.0, 584.0), now);
//!     } else {
//!         session.advance_to(deadline);
//!     }
//! }
//! assert_eq!(session.end_reason(), Some(EndReason::TrialsCompleted));
//! ```
//!
//! ## Modules
//!
//! - [`catalog`]: stimulus pool loading and filtering
//! - [`sequence`]: per-session trial plan generation
//! - [`schedule`]: per-trial response counting and outcomes
//! - [`session`]: ITI/trial/outcome loop and session limits
//! - [`log`]: event records and CSV sinks

#[path = "core/catalog.rs"]
pub mod catalog;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/io.rs"]
pub mod io;

#[path = "core/log.rs"]
pub mod log;

#[path = "core/schedule.rs"]
pub mod schedule;

#[path = "core/sequence.rs"]
pub mod sequence;

#[path = "core/session.rs"]
pub mod session;

#[path = "core/stats.rs"]
pub mod stats;

#[path = "core/timer.rs"]
pub mod timer;

#[path = "core/trial.rs"]
pub mod trial;

/// Prelude module for convenient imports.
///
/// ```
/// use operant::prelude::*;
/// ```
pub mod prelude {
    pub use crate::catalog::{Catalog, Stimulus};
    pub use crate::config::{
        CounterbalanceGroup, ExperimentConfig, Phase, RatioRange, SubjectProfile,
    };
    pub use crate::error::{ConfigError, GenerationError, HardwareWarning, LoadError, SessionError};
    pub use crate::io::{
        LogSink, ReinforcementDevice, Renderer, Screen, SessionContext, VideoFiles, VideoRecorder,
    };
    pub use crate::log::{CsvFileSink, EventKind, EventRecord, MemorySink, SessionLog};
    pub use crate::schedule::{Response, Substage, Target, TrialOutcome};
    pub use crate::sequence::SequenceGenerator;
    pub use crate::session::{EndReason, SessionController, SessionSetup, SessionSnapshot, Stage};
    pub use crate::timer::Millis;
    pub use crate::trial::{Payload, Side, TrialDescriptor, TrialKind, TrialPlan};
}
