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
    error::Error,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{crate_version, Parser, Subcommand};
use imuse::{
    config::{self, SoundBank, SoundEntry},
    sound::{Sound, SoundId},
    synth,
};
use tracing::{error, info};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "An interactive MIDI music engine."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available MIDI output devices.
    Devices {},
    /// Prints the timing, channels, markers and hooks of a MIDI file.
    Inspect {
        /// The path to the MIDI file.
        path: String,
    },
    /// Writes a sound bank listing every MIDI file in a directory.
    Bank {
        /// The directory to scan.
        directory: String,
        /// The sound bank file to write.
        output: String,
    },
    /// Plays sounds through the configured engine until they finish.
    Play {
        /// The path to the engine config.
        config: String,
        /// The sounds to start.
        #[arg(required = true)]
        sounds: Vec<SoundId>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = synth::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Inspect { path } => {
            let sound = Sound::from_file(0, Path::new(&path))?;
            println!("{}", sound);
            println!("Length: {} ticks", sound.length());
            println!("Channels: {:?}", sound.channels());

            let markers = sound.markers();
            println!("Markers (count: {}):", markers.len());
            for (tick, id) in markers {
                println!("- {} at tick {}", id, tick);
            }

            let hooks = sound.hooks();
            println!("Hooks (count: {}):", hooks.len());
            for (tick, hook) in hooks {
                println!(
                    "- class {} value {} channel {} at tick {}",
                    hook.class, hook.value, hook.channel, tick
                );
            }
        }
        Commands::Bank { directory, output } => {
            let output = PathBuf::from(output);
            let bank = bank_from_directory(Path::new(&directory), &output)?;
            if bank.sounds().is_empty() {
                println!("No MIDI files found in {}.", directory);
                return Ok(());
            }
            bank.save(&output)?;
            println!("Sounds (count: {}):", bank.sounds().len());
            for entry in bank.sounds() {
                println!("- {}: {}", entry.id(), entry.file());
            }
        }
        Commands::Play { config, sounds } => {
            let imuse = config::load_engine(Path::new(&config))?;
            for sound in sounds {
                if let Err(e) = imuse.start_sound(sound) {
                    error!(err = e.to_string(), sound, "Unable to start sound.");
                }
            }

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            let mut interval = tokio::time::interval(Duration::from_millis(50));
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        info!("Interrupted, stopping.");
                        break;
                    }
                    _ = interval.tick() => {
                        if imuse.get_sound_status(-1) == 0 {
                            break;
                        }
                    }
                }
            }
            imuse.terminate();
        }
    }

    Ok(())
}

/// Lists the MIDI files in a directory in name order, numbering them from 1. Files are written
/// relative to the bank's directory where possible.
fn bank_from_directory(directory: &Path, output: &Path) -> Result<SoundBank, Box<dyn Error>> {
    let mut files: Vec<PathBuf> = fs::read_dir(directory)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<PathBuf>, _>>()?
        .into_iter()
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(OsStr::to_str)
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("mid") || ext.eq_ignore_ascii_case("midi"))
        })
        .collect();
    files.sort();

    let base = output
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .canonicalize()?;

    let mut entries = Vec::new();
    for (index, file) in files.iter().enumerate() {
        let id = SoundId::try_from(index + 1)?;
        let file = file.canonicalize()?;
        let relative = file.strip_prefix(&base).unwrap_or(&file);
        entries.push(SoundEntry::new(id, &relative.to_string_lossy()));
    }
    Ok(SoundBank::new(entries))
}
