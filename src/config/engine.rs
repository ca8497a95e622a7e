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
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, File};
use duration_string::DurationString;
use serde::Deserialize;

use crate::engine::{Properties, Property};

use super::error::ConfigError;

const DEFAULT_TIMER_PERIOD: Duration = Duration::from_millis(10);

/// A YAML representation of the engine configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct EngineConfig {
    /// The MIDI output device. Names starting with "mock" use the in-memory device.
    device: String,

    /// How often the device timer ticks (default: 10ms).
    timer_period: Option<String>,

    /// How many players may sound at once, 1 to 8 (default: 8).
    player_limit: Option<u32>,

    /// Evict a player of equal priority when the pool is full (default: false).
    recycle_players: Option<bool>,

    /// Playback speed percentage, 50 to 200 (default: 100).
    tempo_base: Option<u32>,

    native_mt32: Option<bool>,
    multi_midi: Option<bool>,
    old_adlib_instruments: Option<bool>,

    /// The sound bank file, relative to this config file.
    sounds: String,
}

impl EngineConfig {
    /// Parses the engine configuration from a YAML file.
    pub fn deserialize(path: &Path) -> Result<EngineConfig, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<EngineConfig>()?)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Returns the timer period, which becomes the device's base tempo.
    pub fn timer_period(&self) -> Result<Duration, ConfigError> {
        match &self.timer_period {
            Some(period) => {
                let period: Duration = DurationString::from_string(period.clone())
                    .map_err(|_| ConfigError::Duration(period.clone()))?
                    .into();
                if period.is_zero() {
                    return Err(ConfigError::Duration(format!("{:?}", self.timer_period)));
                }
                Ok(period)
            }
            None => Ok(DEFAULT_TIMER_PERIOD),
        }
    }

    /// Resolves the sound bank path against the directory holding the config file.
    pub fn sounds_path(&self, config_path: &Path) -> PathBuf {
        config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.sounds)
    }

    /// The engine properties, with out of range values clamped or ignored the same way
    /// scripts setting them would be.
    pub fn properties(&self) -> Properties {
        let mut properties = Properties::default();
        let settings = [
            (Property::LimitPlayers, self.player_limit),
            (Property::RecyclePlayers, self.recycle_players.map(u32::from)),
            (Property::TempoBase, self.tempo_base),
            (Property::NativeMt32, self.native_mt32.map(u32::from)),
            (Property::MultiMidi, self.multi_midi.map(u32::from)),
            (Property::OldAdlibInstruments, self.old_adlib_instruments.map(u32::from)),
        ];
        for (property, value) in settings {
            if let Some(value) = value {
                properties.set(property, value);
            }
        }
        properties
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, fs, path::Path, time::Duration};

    use crate::engine::Properties;

    use super::EngineConfig;

    fn parse(yaml: &str) -> Result<EngineConfig, Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.yaml");
        fs::write(&path, yaml)?;
        Ok(EngineConfig::deserialize(&path)?)
    }

    #[test]
    fn defaults() -> Result<(), Box<dyn Error>> {
        let config = parse("device: mock\nsounds: sounds.yaml\n")?;
        assert_eq!("mock", config.device());
        assert_eq!(Duration::from_millis(10), config.timer_period()?);
        assert_eq!(Properties::default(), config.properties());
        assert_eq!(
            Path::new("/etc/imuse/sounds.yaml"),
            config.sounds_path(Path::new("/etc/imuse/engine.yaml"))
        );
        Ok(())
    }

    #[test]
    fn overrides_are_clamped() -> Result<(), Box<dyn Error>> {
        let config = parse(
            r#"
device: FluidSynth
sounds: bank/sounds.yaml
timer_period: 5ms
player_limit: 12
recycle_players: true
tempo_base: 400
native_mt32: true
"#,
        )?;
        assert_eq!(Duration::from_millis(5), config.timer_period()?);
        let properties = config.properties();
        assert_eq!(8, properties.player_limit);
        assert!(properties.recycle_players);
        assert_eq!(200, properties.tempo_base);
        assert!(properties.native_mt32);
        assert!(!properties.multi_midi);
        Ok(())
    }

    #[test]
    fn bad_timer_period() -> Result<(), Box<dyn Error>> {
        assert!(parse("device: mock\nsounds: s.yaml\ntimer_period: soon\n")?
            .timer_period()
            .is_err());
        assert!(parse("device: mock\nsounds: s.yaml\ntimer_period: 0ms\n")?
            .timer_period()
            .is_err());
        Ok(())
    }

    #[test]
    fn missing_device_is_an_error() {
        assert!(parse("sounds: sounds.yaml\n").is_err());
    }
}
