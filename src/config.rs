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
use std::{error::Error, path::Path};

use tracing::info;

use crate::{imuse::IMuse, sound, synth};

mod engine;
mod error;
mod sounds;

pub use engine::EngineConfig;
pub use error::ConfigError;
pub use sounds::{SoundBank, SoundEntry};

/// Opens the configured device, loads the sound bank and starts an engine on them.
pub fn load_engine(path: &Path) -> Result<IMuse, Box<dyn Error>> {
    let config = EngineConfig::deserialize(path)?;
    let device = synth::get_device(config.device(), config.timer_period()?)?;
    let sounds = sound::load_sounds(&config.sounds_path(path))?;
    info!(
        config = path.display().to_string(),
        device = config.device(),
        "Loaded engine configuration."
    );
    IMuse::new(device, sounds, config.properties())
}

#[cfg(test)]
mod test {
    use std::{error::Error, fs};

    use crate::testutil::{eventually, SmfBuilder};

    use super::load_engine;

    #[test]
    fn engine_from_files() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("music"))?;
        fs::write(
            dir.path().join("music").join("short.mid"),
            SmfBuilder::new(48).tempo(0, 100_000).note(0, 0, 60, 100, 24).build(),
        )?;
        fs::write(dir.path().join("music").join("broken.mid"), b"not a midi file")?;
        fs::write(
            dir.path().join("music").join("sounds.yaml"),
            "sounds:\n  - id: 1\n    file: short.mid\n    priority: 60\n  - id: 2\n    file: broken.mid\n",
        )?;
        let config = dir.path().join("engine.yaml");
        fs::write(
            &config,
            "device: mock\nsounds: music/sounds.yaml\ntimer_period: 1ms\ntempo_base: 150\n",
        )?;

        let imuse = load_engine(&config)?;
        assert_eq!(150, imuse.property(crate::engine::Property::TempoBase));
        // The broken file is skipped rather than failing the whole bank.
        assert_eq!(-1, imuse.do_command(0x08, &[2]));
        assert_eq!(0, imuse.do_command(0x08, &[1]));
        eventually(|| imuse.get_sound_status(1) == 0, "Sound never finished");
        imuse.terminate();
        Ok(())
    }

    #[test]
    fn missing_bank_fails() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = dir.path().join("engine.yaml");
        fs::write(&config, "device: mock\nsounds: nowhere.yaml\n")?;
        assert!(load_engine(&config).is_err());
        Ok(())
    }
}
