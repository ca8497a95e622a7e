// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{fs, path::Path};

use config::{Config, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::sound::{SoundId, DEFAULT_SOUND_PRIORITY};

use super::error::ConfigError;

/// A list of the sounds the engine can play.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct SoundBank {
    sounds: Vec<SoundEntry>,
}

/// One sound in a bank. The file is a Standard MIDI File relative to the bank.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SoundEntry {
    id: SoundId,
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mt32: Option<bool>,
}

impl SoundBank {
    pub fn new(sounds: Vec<SoundEntry>) -> SoundBank {
        SoundBank { sounds }
    }

    /// Parses a sound bank from a YAML file.
    pub fn deserialize(path: &Path) -> Result<SoundBank, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<SoundBank>()?)
    }

    /// Writes the sound bank to a YAML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let serialized = serde_yml::to_string(self)?;
        fs::write(path, serialized)?;
        info!(path = path.display().to_string(), count = self.sounds.len(), "Wrote sound bank.");
        Ok(())
    }

    pub fn sounds(&self) -> &[SoundEntry] {
        &self.sounds
    }
}

impl SoundEntry {
    pub fn new(id: SoundId, file: &str) -> SoundEntry {
        SoundEntry {
            id,
            file: file.to_string(),
            priority: None,
            mt32: None,
        }
    }

    pub fn id(&self) -> SoundId {
        self.id
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// The sound's priority (default: 128).
    pub fn priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_SOUND_PRIORITY)
    }

    /// Whether the sound was written for an MT-32 (default: false).
    pub fn mt32(&self) -> bool {
        self.mt32.unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, fs};

    use super::{SoundBank, SoundEntry};

    #[test]
    fn defaults_and_overrides() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sounds.yaml");
        fs::write(
            &path,
            r#"
sounds:
  - id: 1
    file: intro.mid
  - id: 7
    file: music/battle.mid
    priority: 90
    mt32: true
"#,
        )?;

        let bank = SoundBank::deserialize(&path)?;
        assert_eq!(2, bank.sounds().len());
        let intro = &bank.sounds()[0];
        assert_eq!((1, "intro.mid", 128, false), (intro.id(), intro.file(), intro.priority(), intro.mt32()));
        let battle = &bank.sounds()[1];
        assert_eq!((7, "music/battle.mid", 90, true), (battle.id(), battle.file(), battle.priority(), battle.mt32()));
        Ok(())
    }

    #[test]
    fn saved_bank_reads_back() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bank.yaml");
        SoundBank::new(vec![SoundEntry::new(1, "a.mid"), SoundEntry::new(2, "b.mid")]).save(&path)?;

        let written = fs::read_to_string(&path)?;
        assert!(!written.contains("priority"));
        let bank = SoundBank::deserialize(&path)?;
        assert_eq!(
            vec![SoundEntry::new(1, "a.mid"), SoundEntry::new(2, "b.mid")],
            bank.sounds()
        );
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(SoundBank::deserialize(std::path::Path::new("/nonexistent/sounds.yaml")).is_err());
    }
}
