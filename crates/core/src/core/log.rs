//! Session event log.
//!
//! One record per peck or lifecycle event, in the column layout of the lab's
//! data sheets. Records are appended by the controller only and flushed to a
//! [`LogSink`] in batches; a failed flush leaves the cursor where it was so
//! the next flush retries the same records.

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Phase;
use crate::io::LogSink;
use crate::timer::Millis;
use crate::trial::Side;

const NA: &str = "NA";

pub const CSV_HEADER: [&str; 36] = [
    "Subject",
    "Date",
    "ExpPhaseNum",
    "ExpPhaseName",
    "SessionTime",
    "TrialNum",
    "TrialType",
    "EventType",
    "TrialSubStage",
    "TrialTime",
    "TrialSubStageTimer",
    "ITIDuration",
    "Xcord",
    "Ycord",
    "CenterPythDist",
    "LeftPythDist",
    "RightPythDist",
    "CenterStim",
    "LeftStim",
    "LeftStimTrainingSet",
    "LeftStimNumber",
    "LeftSBEColor",
    "RightStim",
    "RightStimTrainingSet",
    "RightStimNumber",
    "RightSBEColor",
    "SubPhase1RR",
    "SubPhase1LeftButtonPresses",
    "SubPhase1RightButtonPresses",
    "SubPhase2RR",
    "SubPhase2ButtonPresses",
    "CorrectionTrial",
    "CorrectChoice",
    "VideoRecorded",
    "TopVideoFileName",
    "SideVideoFileName",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    ItiStart,
    ItiPeck,
    TrialStart,
    StimulusOnset,
    BackgroundPeck,
    StimulusKeyPeck,
    PretrainingKeyPeck,
    LeftStimulusKeyPeck,
    RightStimulusKeyPeck,
    TerminalLinkKeyPeck,
    LeftStimulusChoice,
    RightStimulusChoice,
    /// Free choice, named after the chosen stimulus (`<stem>_choice`).
    StimulusChoice,
    TerminalLinkCompleted,
    CorrectChoice,
    IncorrectChoice,
    FreeChoice,
    ReinforcerProvided,
    AutoReinforcerProvided,
    HopperClosed,
    CorrectionTimeout,
    CorrectionBackgroundPeck,
    HopperPeck,
    VideoRecordingStarted,
    VideoRecordingStopped,
    HardwareWarning,
    SessionEnds,
}

impl EventKind {
    /// Value of the `EventType` column.
    pub fn label(self) -> &'static str {
        match self {
            EventKind::SessionStarted => "session_started",
            EventKind::ItiStart => "ITI_start",
            EventKind::ItiPeck => "ITI_peck",
            EventKind::TrialStart => "trial_start",
            EventKind::StimulusOnset => "stimulus_onset",
            EventKind::BackgroundPeck => "background_peck",
            EventKind::StimulusKeyPeck => "stimulus_key_peck",
            EventKind::PretrainingKeyPeck => "pretraining_key_peck",
            EventKind::LeftStimulusKeyPeck => "left_stimulus_key_peck",
            EventKind::RightStimulusKeyPeck => "right_stimulus_key_peck",
            EventKind::TerminalLinkKeyPeck => "terminallink_key_peck",
            EventKind::LeftStimulusChoice => "left_stimulus_choice",
            EventKind::RightStimulusChoice => "right_stimulus_choice",
            EventKind::StimulusChoice => "stimulus_choice",
            EventKind::TerminalLinkCompleted => "terminal_link_completed",
            EventKind::CorrectChoice => "correct_choice",
            EventKind::IncorrectChoice => "incorrect_choice",
            EventKind::FreeChoice => "free_choice",
            EventKind::ReinforcerProvided => "reinforcer_provided",
            EventKind::AutoReinforcerProvided => "auto_reinforcer_provided",
            EventKind::HopperClosed => "hopper_closed",
            EventKind::CorrectionTimeout => "correction_timeout",
            EventKind::CorrectionBackgroundPeck => "CP_background_peck",
            EventKind::HopperPeck => "hopper_peck",
            EventKind::VideoRecordingStarted => "video_recording_started",
            EventKind::VideoRecordingStopped => "video_recording_stopped",
            EventKind::HardwareWarning => "hardware_warning",
            EventKind::SessionEnds => "SessionEnds",
        }
    }

    pub fn is_peck(self) -> bool {
        matches!(
            self,
            EventKind::ItiPeck
                | EventKind::BackgroundPeck
                | EventKind::StimulusKeyPeck
                | EventKind::PretrainingKeyPeck
                | EventKind::LeftStimulusKeyPeck
                | EventKind::RightStimulusKeyPeck
                | EventKind::TerminalLinkKeyPeck
                | EventKind::CorrectionBackgroundPeck
                | EventKind::HopperPeck
        )
    }
}

/// Stimulus columns for one side of a two-key trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideColumns {
    pub stim: Option<String>,
    pub training_set: Option<u8>,
    pub number: Option<u8>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub subject: String,
    pub date: NaiveDate,
    pub phase: Phase,
    pub session_time_ms: Millis,
    /// 0 before the first trial.
    pub trial_num: u32,
    pub trial_type: Option<&'static str>,
    pub event: EventKind,
    pub substage: Option<u8>,
    /// Time since the ITI of this trial ended (negative during the ITI).
    pub trial_time_ms: Option<i64>,
    pub substage_time_ms: Option<Millis>,
    pub iti_ms: Option<Millis>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub center_dist: Option<f64>,
    pub left_dist: Option<f64>,
    pub right_dist: Option<f64>,
    pub center_stim: Option<String>,
    pub left: SideColumns,
    pub right: SideColumns,
    pub subphase1_ratio: Option<u32>,
    pub subphase1_left: Option<u32>,
    pub subphase1_right: Option<u32>,
    pub subphase2_ratio: Option<u32>,
    pub subphase2_presses: Option<u32>,
    pub correction: bool,
    pub correct_choice: Option<Side>,
    pub video_recorded: bool,
    pub top_video: Option<String>,
    pub side_video: Option<String>,
    /// Stimulus stem for `StimulusChoice` events.
    pub chosen_stim: Option<String>,
}

impl EventRecord {
    /// A record with every optional column set to `NA`.
    pub fn new(
        subject: impl Into<String>,
        date: NaiveDate,
        phase: Phase,
        session_time_ms: Millis,
        event: EventKind,
    ) -> Self {
        Self {
            subject: subject.into(),
            date,
            phase,
            session_time_ms,
            trial_num: 0,
            trial_type: None,
            event,
            substage: None,
            trial_time_ms: None,
            substage_time_ms: None,
            iti_ms: None,
            x: None,
            y: None,
            center_dist: None,
            left_dist: None,
            right_dist: None,
            center_stim: None,
            left: SideColumns::default(),
            right: SideColumns::default(),
            subphase1_ratio: None,
            subphase1_left: None,
            subphase1_right: None,
            subphase2_ratio: None,
            subphase2_presses: None,
            correction: false,
            correct_choice: None,
            video_recorded: false,
            top_video: None,
            side_video: None,
            chosen_stim: None,
        }
    }

    pub fn csv_header() -> String {
        CSV_HEADER.join(",")
    }

    /// Value of the `EventType` column.
    pub fn event_type(&self) -> String {
        match (self.event, &self.chosen_stim) {
            (EventKind::StimulusChoice, Some(stem)) => format!("{stem}_choice"),
            (event, _) => event.label().to_string(),
        }
    }

    pub fn to_csv_row(&self) -> String {
        let fields: [String; 36] = [
            escape(&self.subject),
            self.date.format("%Y-%m-%d").to_string(),
            self.phase.number().to_string(),
            self.phase.display_name().to_string(),
            seconds(self.session_time_ms as i64),
            self.trial_num.to_string(),
            opt(self.trial_type),
            escape(&self.event_type()),
            opt(self.substage),
            self.trial_time_ms.map(seconds).unwrap_or_else(na),
            self.substage_time_ms
                .map(|ms| seconds(ms as i64))
                .unwrap_or_else(na),
            self.iti_ms.map(|ms| seconds(ms as i64)).unwrap_or_else(na),
            opt(self.x),
            opt(self.y),
            distance(self.center_dist),
            distance(self.left_dist),
            distance(self.right_dist),
            opt_str(&self.center_stim),
            opt_str(&self.left.stim),
            opt(self.left.training_set),
            opt(self.left.number),
            opt_str(&self.left.color),
            opt_str(&self.right.stim),
            opt(self.right.training_set),
            opt(self.right.number),
            opt_str(&self.right.color),
            opt(self.subphase1_ratio),
            opt(self.subphase1_left),
            opt(self.subphase1_right),
            opt(self.subphase2_ratio),
            opt(self.subphase2_presses),
            u8::from(self.correction).to_string(),
            opt(self.correct_choice.map(Side::as_str)),
            u8::from(self.video_recorded).to_string(),
            opt_str(&self.top_video),
            opt_str(&self.side_video),
        ];
        fields.join(",")
    }
}

fn na() -> String {
    NA.to_string()
}

fn seconds(ms: i64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

fn distance(d: Option<f64>) -> String {
    d.map(|d| format!("{d:.3}")).unwrap_or_else(na)
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| escape(&v.to_string())).unwrap_or_else(na)
}

fn opt_str(v: &Option<String>) -> String {
    v.as_deref().map(escape).unwrap_or_else(na)
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Euclidean distance in screen pixels.
pub fn pixel_distance(x: f64, y: f64, center: [f64; 2]) -> f64 {
    ((x - center[0]).powi(2) + (y - center[1]).powi(2)).sqrt()
}

/// `{subject}_{YYYY-mm-dd_HH.MM.SS}_data-Phase{n}.csv`
pub fn session_file_name(subject: &str, started: NaiveDateTime, phase: Phase) -> String {
    format!(
        "{}_{}_data-Phase{}.csv",
        subject,
        started.format("%Y-%m-%d_%H.%M.%S"),
        phase.number()
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// Session log
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    records: Vec<EventRecord>,
    flushed: usize,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EventRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Records not yet accepted by a sink.
    pub fn pending(&self) -> &[EventRecord] {
        &self.records[self.flushed..]
    }

    pub fn flushed(&self) -> usize {
        self.flushed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self, event: EventKind) -> usize {
        self.records.iter().filter(|r| r.event == event).count()
    }

    /// Hand pending records to the sink. The cursor only moves when the sink
    /// accepts the whole batch.
    pub fn flush(&mut self, sink: &mut dyn LogSink) -> io::Result<usize> {
        let pending = self.pending();
        if pending.is_empty() {
            return Ok(0);
        }
        let n = pending.len();
        sink.append(pending)?;
        self.flushed += n;
        Ok(n)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sinks
// ═══════════════════════════════════════════════════════════════════════════

/// Output that can drop a partially written batch.
trait Rollback: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl Rollback for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

/// Write a whole batch or nothing: on failure the output is cut back to
/// `committed` so a retried batch is not duplicated.
fn write_batch<W: Rollback>(out: &mut W, committed: &mut u64, batch: &[u8]) -> io::Result<()> {
    match out.write_all(batch).and_then(|()| out.flush()) {
        Ok(()) => {
            *committed += batch.len() as u64;
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = out.truncate_to(*committed) {
                warn!(committed = *committed, "CSV rollback failed: {}", rollback);
            }
            Err(e)
        }
    }
}

/// Appends CSV rows to one file per session.
pub struct CsvFileSink {
    path: PathBuf,
    file: File,
    /// Bytes of the header plus every accepted batch.
    committed: u64,
}

impl CsvFileSink {
    /// Create the file (and parent directories) and write the header row.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        let mut committed = 0;
        let header = format!("{}\n", EventRecord::csv_header());
        write_batch(&mut file, &mut committed, header.as_bytes())?;
        Ok(Self {
            path,
            file,
            committed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for CsvFileSink {
    fn append(&mut self, records: &[EventRecord]) -> io::Result<()> {
        let mut batch = String::new();
        for r in records {
            batch.push_str(&r.to_csv_row());
            batch.push('\n');
        }
        write_batch(&mut self.file, &mut self.committed, batch.as_bytes())
    }
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemorySink {
    fn append(&mut self, records: &[EventRecord]) -> io::Result<()> {
        let mut buf = self
            .records
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory sink poisoned"))?;
        buf.extend_from_slice(records);
        Ok(())
    }
}

/// Discards everything (data recording switched off).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn append(&mut self, _records: &[EventRecord]) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    struct FailingSink;

    impl LogSink for FailingSink {
        fn append(&mut self, _records: &[EventRecord]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn row_has_one_field_per_column() {
        let r = EventRecord::new("Jubilee", date(), Phase::Autoshaping, 61_234, EventKind::ItiStart);
        let row = r.to_csv_row();
        assert_eq!(row.split(',').count(), CSV_HEADER.len());
        assert!(row.starts_with("Jubilee,2026-03-09,1,Autoshaping/Instrumental,61.234,0,NA,ITI_start,"));
        assert!(row.ends_with(",0,NA,0,NA,NA"));
    }

    #[test]
    fn peck_columns() {
        let mut r = EventRecord::new("TEST", date(), Phase::Choice, 0, EventKind::LeftStimulusKeyPeck);
        r.x = Some(200.0);
        r.y = Some(374.0);
        r.left_dist = Some(pixel_distance(200.0, 374.0, [211.5, 374.0]));
        r.trial_time_ms = Some(-1_500);
        r.correct_choice = Some(Side::Left);
        r.correction = true;
        let row = r.to_csv_row();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[9], "-1.500");
        assert_eq!(fields[12], "200");
        assert_eq!(fields[15], "11.500");
        assert_eq!(fields[31], "1");
        assert_eq!(fields[32], "left");
    }

    #[test]
    fn fields_with_commas_are_quoted() {
        let r = EventRecord::new("A,B", date(), Phase::Pretraining, 0, EventKind::SessionStarted);
        assert!(r.to_csv_row().starts_with("\"A,B\","));
    }

    #[test]
    fn failed_flush_keeps_records_pending() {
        let mut log = SessionLog::new();
        log.push(EventRecord::new("TEST", date(), Phase::Pretraining, 0, EventKind::SessionStarted));
        log.push(EventRecord::new("TEST", date(), Phase::Pretraining, 5, EventKind::ItiStart));

        assert!(log.flush(&mut FailingSink).is_err());
        assert_eq!(log.pending().len(), 2);

        let mut sink = MemorySink::new();
        assert_eq!(log.flush(&mut sink).unwrap(), 2);
        assert_eq!(log.flush(&mut sink).unwrap(), 0);
        assert_eq!(sink.len(), 2);
        assert!(log.pending().is_empty());
    }

    /// Accepts `room` bytes, then reports a full disk.
    struct ShortDisk {
        data: Vec<u8>,
        room: usize,
    }

    impl Write for ShortDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.room);
            self.data.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Rollback for ShortDisk {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn partial_batch_is_rolled_back() {
        let rec = EventRecord::new("TEST", date(), Phase::Choice, 0, EventKind::ItiStart);
        let first = format!("{}\n", rec.to_csv_row());
        let second = format!("{0}\n{0}\n", rec.to_csv_row());

        let mut disk = ShortDisk {
            data: Vec::new(),
            room: first.len() + 10,
        };
        let mut committed = 0;
        write_batch(&mut disk, &mut committed, first.as_bytes()).unwrap();
        assert!(write_batch(&mut disk, &mut committed, second.as_bytes()).is_err());
        assert_eq!(committed, first.len() as u64);
        assert_eq!(disk.data, first.as_bytes());

        // The retry lands each row exactly once.
        disk.room = usize::MAX;
        write_batch(&mut disk, &mut committed, second.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(disk.data).unwrap(), format!("{first}{second}"));
    }

    #[test]
    fn stimulus_choice_names_the_stimulus() {
        let mut r = EventRecord::new("TEST", date(), Phase::Choice, 0, EventKind::StimulusChoice);
        assert_eq!(r.event_type(), "stimulus_choice");
        r.chosen_stim = Some("Probe5".into());
        assert_eq!(r.event_type(), "Probe5_choice");
        assert_eq!(r.to_csv_row().split(',').nth(7), Some("Probe5_choice"));
    }

    #[test]
    fn csv_file_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let started = date().and_hms_opt(9, 5, 7).unwrap();
        let name = session_file_name("Hendrix", started, Phase::Choice);
        assert_eq!(name, "Hendrix_2026-03-09_09.05.07_data-Phase2.csv");

        let path = dir.path().join("Hendrix").join(name);
        let mut sink = CsvFileSink::create(&path).unwrap();
        let rec = EventRecord::new("Hendrix", date(), Phase::Choice, 0, EventKind::SessionStarted);
        sink.append(&[rec.clone(), rec]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], EventRecord::csv_header());
        assert!(lines[1].contains(",session_started,"));
    }
}
