//! Stimulus catalog: the pool of images a session draws from.
//!
//! The tabular source is a CSV file with (at least) the columns
//! `Name`, `TrainingSet` and `StimulusNum`. Training set 0 holds the probe
//! stimuli; sets 1..=5 are the training classes. Stimulus numbers 1..=5 place
//! a stimulus along the feature gradient of its class.

use std::fs;
use std::path::Path;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Training set that holds the probe stimuli.
pub const PROBE_SET: u8 = 0;
/// Highest training-set class.
pub const MAX_TRAINING_SET: u8 = 5;
/// Stimulus numbers run 1..=MAX_STIMULUS_NUMBER.
pub const MAX_STIMULUS_NUMBER: u8 = 5;

const COL_NAME: &str = "Name";
const COL_SET: &str = "TrainingSet";
const COL_NUM: &str = "StimulusNum";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stimulus {
    /// Image file name; doubles as the renderer's image handle.
    pub name: String,
    pub training_set: u8,
    pub number: u8,
}

impl Stimulus {
    pub fn new(name: impl Into<String>, training_set: u8, number: u8) -> Self {
        Self {
            name: name.into(),
            training_set,
            number,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.training_set == PROBE_SET
    }

    /// Opaque image handle handed to the renderer.
    pub fn image(&self) -> &str {
        &self.name
    }

    /// Name without the file extension, used in video file names.
    pub fn label(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    stimuli: Vec<Stimulus>,
}

impl Catalog {
    /// Read and validate a stimulus source file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse CSV text. A leading UTF-8 BOM and blank lines are ignored.
    pub fn parse(text: &str) -> Result<Self, LoadError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
            .filter(|(_, l)| !l.trim().is_empty());

        let (_, header) = lines.next().ok_or(LoadError::Empty)?;
        let header = split_row(header);
        let col = |name: &'static str| {
            header
                .iter()
                .position(|h| h.trim() == name)
                .ok_or(LoadError::MissingColumn(name))
        };
        let name_col = col(COL_NAME)?;
        let set_col = col(COL_SET)?;
        let num_col = col(COL_NUM)?;

        let mut stimuli = Vec::new();
        for (line, row) in lines {
            let fields = split_row(row);
            if fields.len() != header.len() {
                return Err(LoadError::RowWidth {
                    line,
                    expected: header.len(),
                    found: fields.len(),
                });
            }

            let training_set = parse_field(&fields[set_col], line, COL_SET)?;
            if training_set > MAX_TRAINING_SET {
                return Err(LoadError::TrainingSetOutOfRange {
                    line,
                    value: training_set,
                });
            }
            let number = parse_field(&fields[num_col], line, COL_NUM)?;
            if !(1..=MAX_STIMULUS_NUMBER).contains(&number) {
                return Err(LoadError::StimulusNumberOutOfRange {
                    line,
                    value: number,
                });
            }

            stimuli.push(Stimulus::new(fields[name_col].trim(), training_set, number));
        }

        Self::from_stimuli(stimuli)
    }

    /// Build a catalog in memory. Names must be unique.
    pub fn from_stimuli(stimuli: Vec<Stimulus>) -> Result<Self, LoadError> {
        if stimuli.is_empty() {
            return Err(LoadError::Empty);
        }
        let mut seen = HashSet::with_capacity(stimuli.len());
        for s in &stimuli {
            if !seen.insert(s.name.as_str()) {
                return Err(LoadError::DuplicateName(s.name.clone()));
            }
        }
        drop(seen);
        Ok(Self { stimuli })
    }

    /// Built-in 30-image gradient set: five probes plus five stimuli for each
    /// of the five training classes.
    pub fn builtin_gradient_set() -> Self {
        let mut stimuli = Vec::with_capacity(30);
        for n in 1..=MAX_STIMULUS_NUMBER {
            stimuli.push(Stimulus::new(format!("Probe{n}.jpg"), PROBE_SET, n));
        }
        for set in 1..=MAX_TRAINING_SET {
            for n in 1..=MAX_STIMULUS_NUMBER {
                stimuli.push(Stimulus::new(format!("Set{set}_Stim{n}.jpg"), set, n));
            }
        }
        Self { stimuli }
    }

    pub fn len(&self) -> usize {
        self.stimuli.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimuli.is_empty()
    }

    pub fn stimuli(&self) -> &[Stimulus] {
        &self.stimuli
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stimulus> {
        self.stimuli.iter()
    }

    pub fn by_training_set(&self, set: u8) -> Vec<&Stimulus> {
        self.stimuli
            .iter()
            .filter(|s| s.training_set == set)
            .collect()
    }

    pub fn by_stimulus_number(&self, number: u8) -> Vec<&Stimulus> {
        self.stimuli.iter().filter(|s| s.number == number).collect()
    }

    /// Sub-catalog of the stimuli whose number is in `numbers`.
    pub fn restricted_to_numbers(&self, numbers: &[u8]) -> Catalog {
        Catalog {
            stimuli: self
                .stimuli
                .iter()
                .filter(|s| numbers.contains(&s.number))
                .cloned()
                .collect(),
        }
    }

    pub fn probes(&self) -> Vec<&Stimulus> {
        self.by_training_set(PROBE_SET)
    }

    pub fn controls(&self) -> Vec<&Stimulus> {
        self.stimuli.iter().filter(|s| !s.is_probe()).collect()
    }

    pub fn find_probe(&self, number: u8) -> Option<&Stimulus> {
        self.stimuli
            .iter()
            .find(|s| s.is_probe() && s.number == number)
    }
}

fn parse_field(raw: &str, line: usize, column: &'static str) -> Result<u8, LoadError> {
    raw.trim().parse::<u8>().map_err(|_| LoadError::NotNumeric {
        line,
        column,
        value: raw.trim().to_string(),
    })
}

/// Split one CSV row. Double-quoted fields may contain commas; `""` inside a
/// quoted field is a literal quote.
pub(crate) fn split_row(row: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = row.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    quoted = false;
                }
            }
            '"' if field.trim().is_empty() => {
                field.clear();
                quoted = true;
            }
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}
