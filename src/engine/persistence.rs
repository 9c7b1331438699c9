use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;

use crate::{PersonaData, Result, StoreData};

/// Handles disk I/O for the [`MemStore`](crate::engine::MemStore).
///
/// Each persona is stored as one `<persona>.json` file. Writes go to a
/// `.json.tmp` sibling first and are renamed into place, so an external
/// observer sees either the old file or the new one, never a torn write.
pub struct Persistence {
    data_dir: PathBuf,
    // Serializes filesystem operations on the data directory. Held only
    // inside save/load, never across the engine's foreground.
    fs_lock: Mutex<()>,
}

impl Persistence {
    /// Initializes a new `Persistence` handler in the specified directory,
    /// creating it (and parents) if absent.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            data_dir: dir,
            fs_lock: Mutex::new(()),
        })
    }

    /// Writes a single persona's subtree to its JSON file atomically.
    pub fn save_persona(&self, persona_id: &str, data: &PersonaData) -> Result<()> {
        let _guard = self.fs_lock.lock().unwrap();

        let file_path = self.data_dir.join(format!("{persona_id}.json"));
        let temp_path = self.data_dir.join(format!("{persona_id}.json.tmp"));

        let bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &file_path)?;

        Ok(())
    }

    /// Loads every persona found in the data directory.
    ///
    /// Scans for `.json` files and parses each into a persona subtree keyed
    /// by the filename stem. Files that cannot be read or decoded are
    /// logged and skipped; boot proceeds with whatever parsed.
    pub fn load_all(&self) -> Result<StoreData> {
        let _guard = self.fs_lock.lock().unwrap();

        let mut all_data = StoreData::new();

        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(persona_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let content = match fs::read(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("could not read persona file {}: {e}", path.display());
                    continue;
                }
            };

            let persona_data: PersonaData = match serde_json::from_slice(&content) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        "could not unmarshal persona data from {}: {e}",
                        path.display()
                    );
                    continue;
                }
            };

            all_data.insert(persona_id.to_string(), persona_data);
        }

        Ok(all_data)
    }
}
