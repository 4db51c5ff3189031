//! The append-log persistor.
//!
//! Saves are an ordered sequence of independently-deserializable JSON
//! records, one per line, preceded by a single header record. Loading
//! tolerates a missing header (older save format) by re-treating the first
//! line as data, with a warning; it is never lossy in that path.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TellusError};

/// Directory created under the persistence root for save files.
pub const SAVE_DIR: &str = "tellus-persistence";

/// Key identifying a header record.
pub const HEADER_KEY: &str = "persistor";

/// The header record written at the top of every save file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveHeader {
    /// Persistor type tag.
    #[serde(rename = "persistor")]
    pub persistor: String,
    /// Software version that wrote the save.
    #[serde(rename = "tellus-version")]
    pub version: String,
    /// When the save was written.
    #[serde(rename = "file-saved")]
    pub saved: String,
    /// Cumulative saves for this process run.
    #[serde(rename = "current-run-file-saves")]
    pub save_counts: u64,
}

/// The result of loading a save: the header (when one was present) plus the
/// raw data records, in order.
#[derive(Debug, Default)]
pub struct LoadedSave {
    pub header: Option<SaveHeader>,
    pub records: Vec<String>,
}

/// The durability collaborator the registry delegates to.
pub trait Persistor: Send + Sync {
    /// Write every record out, preceded by a fresh header.
    fn persist(&mut self, records: &[String]) -> Result<()>;

    /// Read the save back, separating header from data.
    fn load(&mut self) -> Result<LoadedSave>;

    /// Where the save lives, if anywhere.
    fn persistence_file(&self) -> Option<PathBuf> {
        None
    }

    /// True when saving falls back to the local working directory.
    fn is_local_persistence(&self) -> bool {
        false
    }

    /// The raw save-file contents, for debugging.
    fn read_file(&self) -> String {
        "This persistor has no readable save file.".to_string()
    }
}

/// File-backed persistor: one save file, rewritten wholesale on each persist.
pub struct FilePersistor {
    persist_root: Option<PathBuf>,
    save_file: String,
    save_counts: u64,
}

impl FilePersistor {
    /// `persist_root` of `None` falls back to the current working directory,
    /// which should generally only be true for testing.
    pub fn new(persist_root: Option<PathBuf>, save_file: &str) -> Result<FilePersistor> {
        if save_file.is_empty() {
            return Err(TellusError::PersistenceSetup(
                "Save file must be specified.".to_string(),
            ));
        }
        match &persist_root {
            None => log::error!(
                "NO PERSISTENCE ROOT SPECIFIED - this should generally only be true \
                 for testing. Saving to the current directory."
            ),
            Some(root) => log::info!("Setting persistence root to: {}", root.display()),
        }
        Ok(FilePersistor {
            persist_root,
            save_file: save_file.to_string(),
            save_counts: 0,
        })
    }

    fn persistence_root(&self) -> PathBuf {
        match &self.persist_root {
            Some(root) => root.clone(),
            None => PathBuf::from("."),
        }
    }

    pub fn persistence_dir(&self) -> PathBuf {
        self.persistence_root().join(SAVE_DIR)
    }

    fn save_path(&self) -> PathBuf {
        self.persistence_dir().join(&self.save_file)
    }

    fn initialize_persistence_directory(&self) -> Result<()> {
        let dir = self.persistence_dir();
        if dir.exists() {
            log::error!("Persistence directory '{}' already exists.", dir.display());
            return Ok(());
        }
        fs::create_dir_all(&dir)?;
        log::info!(
            "Successfully created persistence directory '{}'.",
            dir.display()
        );
        Ok(())
    }

    fn construct_file_header(&mut self) -> SaveHeader {
        self.save_counts += 1;
        SaveHeader {
            persistor: "FilePersistor".to_string(),
            version: crate::VERSION.to_string(),
            saved: Utc::now().to_rfc3339(),
            save_counts: self.save_counts,
        }
    }

    /// Decide whether the first line of a save is a header. A line that
    /// parses as a JSON object carrying the persistor key is a header;
    /// anything else is assumed to be data from an older save format.
    fn parse_header(first_line: &str) -> Result<Option<SaveHeader>> {
        let value: Value = serde_json::from_str(first_line)?;
        if value.as_object().is_some_and(|map| map.contains_key(HEADER_KEY)) {
            let header: SaveHeader = serde_json::from_value(value)?;
            log::info!("Successfully verified save file header: {header:?}");
            return Ok(Some(header));
        }
        log::warn!(
            "The first line of the save file was not a header. This should be true \
             only when converting from an older save file; treating it as data. \
             Line: {first_line}"
        );
        Ok(None)
    }

    fn write_save_file(&mut self, path: &Path, records: &[String]) -> Result<()> {
        let header = self.construct_file_header();
        let mut contents = serde_json::to_string(&header)?;
        for record in records {
            contents.push('\n');
            contents.push_str(record);
        }
        fs::write(path, contents)?;
        Ok(())
    }
}

impl Persistor for FilePersistor {
    fn persist(&mut self, records: &[String]) -> Result<()> {
        let path = self.save_path();
        log::info!("Saving to [{}].", path.display());
        if !self.persistence_dir().exists() {
            log::info!(
                "No persistence directory. Creating it at: {}",
                self.persistence_dir().display()
            );
            self.initialize_persistence_directory()?;
        }
        self.write_save_file(&path, records)
    }

    fn load(&mut self) -> Result<LoadedSave> {
        let path = self.save_path();
        log::info!("Loading save file '{}'.", path.display());
        if !path.exists() {
            log::info!(
                "Persistence file '{}' doesn't exist yet. Making sure the directory exists...",
                path.display()
            );
            self.initialize_persistence_directory()?;
            return Ok(LoadedSave::default());
        }

        let contents = fs::read_to_string(&path)?;
        let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
        let mut loaded = LoadedSave::default();

        if let Some(first) = lines.next() {
            match FilePersistor::parse_header(first)? {
                Some(header) => loaded.header = Some(header),
                None => loaded.records.push(first.to_string()),
            }
        }
        loaded.records.extend(lines.map(str::to_string));
        Ok(loaded)
    }

    fn persistence_file(&self) -> Option<PathBuf> {
        Some(self.save_path())
    }

    fn is_local_persistence(&self) -> bool {
        self.persist_root.is_none()
    }

    fn read_file(&self) -> String {
        let path = self.save_path();
        if !path.exists() {
            return format!("No save file currently exists at: {}", path.display());
        }
        fs::read_to_string(&path)
            .unwrap_or_else(|error| format!("Unable to read save file: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistor_in(dir: &Path) -> FilePersistor {
        FilePersistor::new(Some(dir.to_path_buf()), "test_save.txt").unwrap()
    }

    #[test]
    fn test_requires_a_save_file_name() {
        assert!(matches!(
            FilePersistor::new(None, ""),
            Err(TellusError::PersistenceSetup(_))
        ));
    }

    #[test]
    fn test_persist_then_load_round_trips_header_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut persistor = persistor_in(dir.path());

        let records = vec![
            "{\"alias\":\"one\"}".to_string(),
            "{\"alias\":\"two\"}".to_string(),
        ];
        persistor.persist(&records).unwrap();
        persistor.persist(&records).unwrap();

        let loaded = persistor.load().unwrap();
        let header = loaded.header.expect("header expected");
        assert_eq!(header.persistor, "FilePersistor");
        assert_eq!(header.version, crate::VERSION);
        assert_eq!(header.save_counts, 2);
        assert_eq!(loaded.records, records);
    }

    #[test]
    fn test_load_without_header_recovers_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut persistor = persistor_in(dir.path());

        // An older save: no header line at all.
        fs::create_dir_all(persistor.persistence_dir()).unwrap();
        fs::write(
            persistor.persistence_file().unwrap(),
            "{\"alias\":\"first\"}\n{\"alias\":\"second\"}",
        )
        .unwrap();

        let loaded = persistor.load().unwrap();
        assert!(loaded.header.is_none());
        assert_eq!(
            loaded.records,
            vec![
                "{\"alias\":\"first\"}".to_string(),
                "{\"alias\":\"second\"}".to_string()
            ]
        );
    }

    #[test]
    fn test_load_missing_file_initializes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut persistor = persistor_in(dir.path());
        let loaded = persistor.load().unwrap();
        assert!(loaded.header.is_none());
        assert!(loaded.records.is_empty());
        assert!(persistor.persistence_dir().exists());
    }

    #[test]
    fn test_read_file_reports_missing_save() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = persistor_in(dir.path());
        assert!(persistor.read_file().contains("No save file"));
    }

    #[test]
    fn test_local_persistence_flag() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!persistor_in(dir.path()).is_local_persistence());
        assert!(FilePersistor::new(None, "x.txt")
            .unwrap()
            .is_local_persistence());
    }
}
