//! Newline-delimited JSON protocol between `operantd` and its clients.

use operant::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    GetStatus,
    ListSubjects,
    /// Prepare a session; the subject still has to be placed in the box.
    StartSession {
        subject: String,
        phase: String,
        #[serde(default)]
        seed: Option<u64>,
        /// Falls back to the config's `record_video`.
        #[serde(default)]
        record_video: Option<bool>,
    },
    /// Subject is in the box: start the first delay.
    BeginTrials,
    Touch {
        target: Target,
        x: f64,
        y: f64,
    },
    Abort,
    PreviewPlan {
        subject: String,
        phase: String,
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Stream `Screen` responses on this connection.
    Subscribe,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Status(Box<DaemonStatus>),
    Subjects { subjects: Vec<SubjectEntry> },
    Plan { plan: TrialPlan },
    Screen { screen: Screen },
    Success { message: String },
    Error { message: String },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response::Success {
            message: message.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStatus {
    #[serde(default)]
    pub session: Option<SessionSnapshot>,
    #[serde(default)]
    pub substage: Option<Substage>,
    #[serde(default)]
    pub data_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectEntry {
    pub name: String,
    pub group: u8,
    #[serde(default)]
    pub test: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_type() {
        let req: Request = serde_json::from_str(
            r#"{"type":"Touch","target":"terminal_link","x":500.5,"y":366.5}"#,
        )
        .unwrap();
        assert!(matches!(
            req,
            Request::Touch {
                target: Target::TerminalLink,
                ..
            }
        ));

        let req: Request =
            serde_json::from_str(r#"{"type":"StartSession","subject":"TEST","phase":"choice"}"#)
                .unwrap();
        match req {
            Request::StartSession {
                seed, record_video, ..
            } => {
                assert_eq!(seed, None);
                assert_eq!(record_video, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_round_trips_through_json() {
        let resp = Response::Status(Box::new(DaemonStatus::default()));
        let line = serde_json::to_string(&resp).unwrap();
        assert!(line.starts_with(r#"{"type":"Status""#));
        let back: Response = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, Response::Status(s) if s.session.is_none()));
    }

    #[test]
    fn screens_nest_their_own_tag() {
        let resp = Response::Screen {
            screen: Screen::Iti { ms: 1_000 },
        };
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(line, r#"{"type":"Screen","screen":{"screen":"iti","ms":1000}}"#);
    }
}
