//! Cross-platform application paths

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use operant::config::Phase;
use operant::log::session_file_name;

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, String> {
        let data_dir = Self::get_data_dir()?;
        Self::at(data_dir)
    }

    /// Rooted somewhere other than the OS data directory.
    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self, String> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .map_err(|e| format!("Failed to create data directory: {}", e))?;
        Ok(Self { data_dir })
    }

    fn get_data_dir() -> Result<PathBuf, String> {
        let base = dirs::data_dir().ok_or("Could not determine data directory")?;
        Ok(base.join("operant"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// `<data>/sessions/<subject>/<subject>_<timestamp>_data-Phase<n>.csv`
    pub fn session_file(&self, subject: &str, started: NaiveDateTime, phase: Phase) -> PathBuf {
        self.data_dir
            .join("sessions")
            .join(subject)
            .join(session_file_name(subject, started, phase))
    }

    pub fn videos_dir(&self, subject: &str) -> PathBuf {
        self.data_dir.join("videos").join(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_file_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let paths = AppPaths::at(&dir).unwrap();
        let started = chrono::NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(14, 5, 9)
            .unwrap();
        let file = paths.session_file("Jubilee", started, Phase::Choice);
        assert_eq!(
            file,
            dir.join("sessions")
                .join("Jubilee")
                .join("Jubilee_2026-03-02_14.05.09_data-Phase2.csv")
        );
        assert_eq!(paths.videos_dir("Jubilee"), dir.join("videos").join("Jubilee"));
        assert_eq!(paths.config_file(), dir.join("config.json"));
    }
}
