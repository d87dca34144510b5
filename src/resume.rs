use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::backend::ResumeStore;
use crate::error::{PipelineError, Result};

/// Resume store that lives only as long as the process
#[derive(Default)]
pub struct MemoryResumeStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// File layout:
/// ```toml
/// [markers]
/// pending_recording_id = "rec_..."
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
struct ResumeFile {
    #[serde(default)]
    markers: BTreeMap<String, String>,
}

/// Resume store persisted as a TOML file in the state directory
///
/// Writes hold an exclusive lock on a sibling `.lock` file so two instances
/// sharing a state directory do not interleave read-modify-write cycles.
pub struct FileResumeStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileResumeStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir)?;
        Ok(Self {
            path: state_dir.join("resume.toml"),
            lock_path: state_dir.join("resume.lock"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<ResumeFile> {
        if !self.path.exists() {
            return Ok(ResumeFile::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to parse resume file '{}': {}",
                self.path.display(),
                e
            ))
        })
    }

    fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut ResumeFile),
    {
        let lock_file: File = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        lock_file.lock_exclusive()?;

        let mut file = self.load()?;
        change(&mut file);
        let content = toml::to_string(&file)
            .map_err(|e| PipelineError::Config(format!("Failed to encode resume file: {}", e)))?;
        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;

        lock_file.unlock()?;
        Ok(())
    }
}

impl ResumeStore for FileResumeStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.load() {
            Ok(file) => file.markers.get(key).cloned(),
            Err(e) => {
                log::warn!("Ignoring unreadable resume file: {}", e);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|file| {
            file.markers.insert(key.to_string(), value.to_string());
        })
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.update(|file| {
            file.markers.remove(key);
        })
    }
}
