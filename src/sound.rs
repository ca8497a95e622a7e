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
    collections::HashMap,
    error::Error,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use tracing::{error, info, warn};

use crate::config;

/// Identifies a sound in the library. Scripts refer to sounds by this number.
pub type SoundId = u16;

/// Priority given to sounds that don't specify one.
pub const DEFAULT_SOUND_PRIORITY: u8 = 128;

/// Manufacturer byte of the engine's own system exclusive messages.
const IMUSE_SYSEX_ID: u8 = 0x7D;
const SYSEX_PART_SETUP: u8 = 0x00;
const SYSEX_MARKER: u8 = 0x01;
const SYSEX_HOOK: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum SoundError {
    #[error("malformed sound data: {0}")]
    Malformed(#[from] midly::Error),
    #[error("unsupported timing, only metrical (ticks per beat) timing is supported")]
    UnsupportedTiming,
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Initial state for one track channel, sent as a part setup system exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartSetup {
    pub channel: u8,
    pub enabled: bool,
    pub percussion: bool,
    pub priority: i8,
    pub volume: u8,
    pub pan: i8,
    pub transpose: i8,
    pub detune: i8,
    pub program: Option<u8>,
}

/// A conditional point in the music that scripts arm to re-arrange playback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookEvent {
    pub class: u8,
    pub value: u8,
    pub channel: u8,
    pub args: [u8; 3],
}

/// A single event in a sound's merged timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoundEvent {
    Midi { channel: u8, message: MidiMessage },
    /// Microseconds per beat.
    Tempo(u32),
    Marker(u8),
    PartSetup(PartSetup),
    Hook(HookEvent),
    End,
}

/// An event and the absolute tick it occurs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimedEvent {
    pub tick: u32,
    pub event: SoundEvent,
}

/// A parsed music resource.
#[derive(Debug)]
pub struct Sound {
    id: SoundId,
    priority: u8,
    mt32: bool,
    ticks_per_beat: u16,
    events: Vec<TimedEvent>,
}

impl Sound {
    /// Parses a Standard MIDI File. All tracks are merged into one timeline ordered by tick,
    /// terminated by a single end event.
    pub fn parse(id: SoundId, bytes: &[u8]) -> Result<Sound, SoundError> {
        let smf = Smf::parse(bytes)?;
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(ticks) => ticks.as_int().max(1),
            Timing::Timecode(_, _) => return Err(SoundError::UnsupportedTiming),
        };

        let mut events = Vec::new();
        let mut end_tick = 0u32;
        let mut track_start = 0u32;
        for track in smf.tracks.iter() {
            let mut tick = track_start;
            for event in track.iter() {
                tick = tick.saturating_add(event.delta.as_int());
                if let Some(event) = convert(&event.kind) {
                    events.push(TimedEvent { tick, event });
                }
            }
            end_tick = end_tick.max(tick);
            if smf.header.format == Format::Sequential {
                track_start = tick;
            }
        }

        // Stable, so events on the same tick keep their track order.
        events.sort_by_key(|event| event.tick);
        events.push(TimedEvent {
            tick: end_tick,
            event: SoundEvent::End,
        });

        Ok(Sound {
            id,
            priority: DEFAULT_SOUND_PRIORITY,
            mt32: false,
            ticks_per_beat,
            events,
        })
    }

    /// Reads and parses a Standard MIDI File from disk.
    pub fn from_file(id: SoundId, path: &Path) -> Result<Sound, SoundError> {
        let bytes = fs::read(path).map_err(|source| SoundError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Sound::parse(id, &bytes)
    }

    pub fn with_priority(mut self, priority: u8) -> Sound {
        self.priority = priority;
        self
    }

    /// Marks the sound as authored for an MT-32.
    pub fn with_mt32(mut self, mt32: bool) -> Sound {
        self.mt32 = mt32;
        self
    }

    pub fn id(&self) -> SoundId {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn mt32(&self) -> bool {
        self.mt32
    }

    pub fn ticks_per_beat(&self) -> u16 {
        self.ticks_per_beat
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    /// The tick the sound ends on.
    pub fn length(&self) -> u32 {
        self.events.last().map(|event| event.tick).unwrap_or(0)
    }

    /// Returns the marker ids in the order they occur.
    pub fn markers(&self) -> Vec<(u32, u8)> {
        self.events
            .iter()
            .filter_map(|event| match event.event {
                SoundEvent::Marker(id) => Some((event.tick, id)),
                _ => None,
            })
            .collect()
    }

    /// Returns the hooks in the order they occur.
    pub fn hooks(&self) -> Vec<(u32, HookEvent)> {
        self.events
            .iter()
            .filter_map(|event| match event.event {
                SoundEvent::Hook(hook) => Some((event.tick, hook)),
                _ => None,
            })
            .collect()
    }

    /// Returns the track channels that carry channel messages or part setups.
    pub fn channels(&self) -> Vec<u8> {
        let mut channels: Vec<u8> = self
            .events
            .iter()
            .filter_map(|event| match event.event {
                SoundEvent::Midi { channel, .. } => Some(channel),
                SoundEvent::PartSetup(setup) => Some(setup.channel),
                _ => None,
            })
            .collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }
}

impl fmt::Display for Sound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sound {} (priority {}, {} ticks per beat, {} events)",
            self.id,
            self.priority,
            self.ticks_per_beat,
            self.events.len()
        )
    }
}

/// Converts a track event into a timeline event. Events the engine has no use for are dropped.
fn convert(kind: &TrackEventKind) -> Option<SoundEvent> {
    match kind {
        TrackEventKind::Midi { channel, message } => Some(SoundEvent::Midi {
            channel: channel.as_int(),
            message: *message,
        }),
        TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => Some(SoundEvent::Tempo(tempo.as_int())),
        TrackEventKind::Meta(MetaMessage::Marker(text)) => std::str::from_utf8(text)
            .ok()
            .and_then(|text| text.trim().parse::<u8>().ok())
            .map(SoundEvent::Marker),
        TrackEventKind::SysEx(data) => parse_sysex(data),
        _ => None,
    }
}

/// Parses one of the engine's own system exclusive messages. The data excludes the leading 0xF0.
fn parse_sysex(data: &[u8]) -> Option<SoundEvent> {
    let data = data.strip_suffix(&[0xF7]).unwrap_or(data);
    let (&manufacturer, rest) = data.split_first()?;
    if manufacturer != IMUSE_SYSEX_ID {
        return None;
    }
    let (&kind, payload) = rest.split_first()?;

    match (kind, payload) {
        (SYSEX_PART_SETUP, [channel, flags, priority, volume, pan, transpose, detune, program, ..]) => {
            Some(SoundEvent::PartSetup(PartSetup {
                channel: channel & 0x0F,
                enabled: flags & 0x01 != 0,
                percussion: flags & 0x02 != 0,
                priority: centered(*priority),
                volume: volume & 0x7F,
                pan: centered(*pan),
                transpose: centered(*transpose),
                detune: centered(*detune),
                program: (flags & 0x04 != 0).then_some(program & 0x7F),
            }))
        }
        (SYSEX_MARKER, [id, ..]) => Some(SoundEvent::Marker(*id)),
        (SYSEX_HOOK, [class, value, channel, a0, a1, a2, ..]) => Some(SoundEvent::Hook(HookEvent {
            class: *class,
            value: *value,
            channel: *channel,
            args: [*a0, *a1, *a2],
        })),
        _ => {
            warn!(kind, len = payload.len(), "Ignoring malformed engine system exclusive.");
            None
        }
    }
}

/// Converts a 7-bit value centered on 64 into a signed value.
fn centered(value: u8) -> i8 {
    ((value & 0x7F) as i16 - 64) as i8
}

/// Where the engine looks up sounds by id.
pub trait SoundLibrary: Send + Sync {
    fn sound(&self, id: SoundId) -> Option<Arc<Sound>>;
}

/// An in-memory sound library.
#[derive(Default)]
pub struct Sounds {
    sounds: HashMap<SoundId, Arc<Sound>>,
}

impl Sounds {
    pub fn new() -> Sounds {
        Sounds::default()
    }

    /// Adds a sound, replacing any sound with the same id.
    pub fn insert(&mut self, sound: Sound) {
        self.sounds.insert(sound.id(), Arc::new(sound));
    }

    pub fn len(&self) -> usize {
        self.sounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sounds.is_empty()
    }
}

impl SoundLibrary for Sounds {
    fn sound(&self, id: SoundId) -> Option<Arc<Sound>> {
        self.sounds.get(&id).cloned()
    }
}

/// Loads every sound listed in a sound bank file. Files are resolved relative to the bank.
/// Sounds that fail to load are logged and skipped.
pub fn load_sounds(bank_path: &Path) -> Result<Arc<Sounds>, Box<dyn Error>> {
    let bank = config::SoundBank::deserialize(bank_path)?;
    let base = bank_path.parent().unwrap_or_else(|| Path::new("."));

    let mut sounds = Sounds::new();
    for entry in bank.sounds() {
        let path = base.join(entry.file());
        match Sound::from_file(entry.id(), &path) {
            Ok(sound) => sounds.insert(
                sound
                    .with_priority(entry.priority())
                    .with_mt32(entry.mt32()),
            ),
            Err(e) => error!(
                err = e.to_string(),
                sound = entry.id(),
                file = path.display().to_string(),
                "Error loading sound."
            ),
        }
    }
    info!(count = sounds.len(), bank = bank_path.display().to_string(), "Loaded sounds.");
    Ok(Arc::new(sounds))
}
