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

//! Saved engine state.
//!
//! ```text
//! "IMUS" magic
//! u16    version
//!        engine record
//! u8     player count, then player records
//! u8     part count, then part records
//! ```
//!
//! Records are a flat list of little endian fields described by a table per
//! record type. Each field names the version that introduced it and,
//! optionally, the version that dropped it, so a stream written by any earlier
//! version can be walked field by field.

use tracing::{info, warn};

use crate::sound::SoundId;

use super::{
    deferred::{Deferred, DeferredCommands, MAX_DEFERRED},
    fader::{FadeKind, Fader, MAX_FADERS},
    player::Loop,
    queue::{CommandQueue, QueueEntry, ENTRY_WORDS, QUEUE_SIZE},
    triggers::{Trigger, TriggerTable, MAX_TRIGGERS},
    volume::{Volume, VOLUME_GROUPS},
    Command, Engine, Part, Player, MAX_PARTS, MAX_PLAYERS,
};

pub const MAGIC: &[u8; 4] = b"IMUS";
pub const CURRENT_VERSION: u16 = 5;

/// First version that stores the players' event cursors.
const CURSOR_VERSION: u16 = 5;

/// Pool index meaning "none".
const NO_INDEX: i64 = 0xFF;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SaveError {
    #[error("not an engine save")]
    BadMagic,
    #[error("unsupported save version {0}")]
    UnsupportedVersion(u16),
    #[error("save data is truncated")]
    Truncated,
    #[error("{what} index {index} is out of range")]
    IndexOutOfRange { what: &'static str, index: i64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

/// One entry of a record's field table.
#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub count: usize,
    /// First version that stores the field.
    pub since: u16,
    /// First version that no longer stores it.
    pub until: Option<u16>,
}

impl Field {
    const fn new(name: &'static str, kind: FieldKind, since: u16) -> Field {
        Field {
            name,
            kind,
            count: 1,
            since,
            until: None,
        }
    }

    const fn array(name: &'static str, kind: FieldKind, count: usize, since: u16) -> Field {
        Field {
            name,
            kind,
            count,
            since,
            until: None,
        }
    }

    const fn until(mut self, version: u16) -> Field {
        self.until = Some(version);
        self
    }

    /// True if streams of the given version carry this field.
    fn stored_in(&self, version: u16) -> bool {
        version >= self.since && self.until.is_none_or(|until| version < until)
    }
}

/// A record with a field table.
pub trait Saveable {
    const FIELDS: &'static [Field];

    fn save_field(&self, name: &str, index: usize) -> i64;

    /// Only called for fields the current version still has.
    fn load_field(&mut self, name: &str, index: usize, value: i64);
}

struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn put(&mut self, kind: FieldKind, value: i64) {
        match kind {
            FieldKind::Bool => self.bytes.push(u8::from(value != 0)),
            FieldKind::U8 | FieldKind::I8 => self.bytes.push(value as u8),
            FieldKind::U16 | FieldKind::I16 => self.bytes.extend((value as u16).to_le_bytes()),
            FieldKind::U32 | FieldKind::I32 => self.bytes.extend((value as u32).to_le_bytes()),
        }
    }

    fn record<T: Saveable>(&mut self, record: &T, version: u16) {
        for field in T::FIELDS.iter().filter(|field| field.stored_in(version)) {
            for index in 0..field.count {
                self.put(field.kind, record.save_field(field.name, index));
            }
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], SaveError> {
        let end = self.position + N;
        let bytes = self
            .bytes
            .get(self.position..end)
            .ok_or(SaveError::Truncated)?;
        self.position = end;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn get(&mut self, kind: FieldKind) -> Result<i64, SaveError> {
        Ok(match kind {
            FieldKind::Bool => i64::from(self.take::<1>()?[0] != 0),
            FieldKind::U8 => i64::from(self.take::<1>()?[0]),
            FieldKind::I8 => i64::from(self.take::<1>()?[0] as i8),
            FieldKind::U16 => i64::from(u16::from_le_bytes(self.take()?)),
            FieldKind::I16 => i64::from(i16::from_le_bytes(self.take()?)),
            FieldKind::U32 => i64::from(u32::from_le_bytes(self.take()?)),
            FieldKind::I32 => i64::from(i32::from_le_bytes(self.take()?)),
        })
    }

    fn record<T: Saveable>(&mut self, record: &mut T, version: u16) -> Result<(), SaveError> {
        for field in T::FIELDS.iter().filter(|field| field.stored_in(version)) {
            let obsolete = !field.stored_in(CURRENT_VERSION);
            for index in 0..field.count {
                let value = self.get(field.kind)?;
                if !obsolete {
                    record.load_field(field.name, index, value);
                }
            }
        }
        Ok(())
    }
}

/// Engine wide state that isn't in the pools.
#[derive(Clone, Debug, Default)]
struct Globals {
    volume: Volume,
    tempo_base: u32,
    queue: CommandQueue,
    triggers: TriggerTable,
    deferred: DeferredCommands,
}

const TRIGGER_WORDS: usize = 11;
const DEFERRED_WORDS: usize = 9;

fn command_words(command: Command, words: &mut [i32]) {
    words[0] = command.opcode;
    words[1..].copy_from_slice(&command.args);
}

fn trigger_words(trigger: Option<Trigger>) -> [i32; TRIGGER_WORDS] {
    let mut words = [0; TRIGGER_WORDS];
    if let Some(trigger) = trigger {
        words[0] = 1;
        words[1] = i32::from(trigger.sound);
        words[2] = i32::from(trigger.marker);
        words[3] = trigger.age as i32;
        command_words(trigger.command, &mut words[4..]);
    }
    words
}

fn trigger_from_words(words: [i32; TRIGGER_WORDS]) -> Option<Trigger> {
    (words[0] != 0).then(|| Trigger {
        sound: SoundId::try_from(words[1]).unwrap_or_default(),
        marker: u8::try_from(words[2]).unwrap_or_default(),
        age: words[3] as u32,
        command: Command::new(words[4], &words[5..]),
    })
}

fn deferred_words(deferred: Option<Deferred>) -> [i32; DEFERRED_WORDS] {
    let mut words = [0; DEFERRED_WORDS];
    if let Some(deferred) = deferred {
        words[0] = 1;
        words[1] = deferred.ticks as i32;
        command_words(deferred.command, &mut words[2..]);
    }
    words
}

fn deferred_from_words(words: [i32; DEFERRED_WORDS]) -> Option<Deferred> {
    (words[0] != 0).then(|| Deferred {
        ticks: (words[1] as u32).max(1),
        command: Command::new(words[2], &words[3..]),
    })
}

/// Sets one word of a record stored as a group of words, through its word form.
fn set_word<T: Copy, const N: usize>(
    slot: &mut T,
    index: usize,
    value: i64,
    to: fn(T) -> [i32; N],
    from: fn([i32; N]) -> T,
) {
    let mut words = to(*slot);
    words[index] = value as i32;
    *slot = from(words);
}

impl Saveable for Globals {
    const FIELDS: &'static [Field] = &[
        Field::new("master", FieldKind::U8, 1),
        Field::new("music", FieldKind::U8, 1),
        Field::array("groups", FieldKind::U8, VOLUME_GROUPS, 1),
        Field::new("tempo_base", FieldKind::U16, 1),
        Field::array("queue", FieldKind::I32, QUEUE_SIZE * ENTRY_WORDS, 1),
        Field::new("queue_read", FieldKind::U8, 1),
        Field::new("queue_write", FieldKind::U8, 1),
        Field::new("queue_adding", FieldKind::Bool, 1),
        Field::new("trigger_count", FieldKind::U16, 1),
        Field::new("recording_sound", FieldKind::I32, 1),
        Field::new("recording_marker", FieldKind::U8, 1),
        Field::array("triggers", FieldKind::I32, MAX_TRIGGERS * TRIGGER_WORDS, 4),
        Field::new("trigger_clock", FieldKind::U32, 4),
        Field::array("deferred", FieldKind::I32, MAX_DEFERRED * DEFERRED_WORDS, 4),
    ];

    fn save_field(&self, name: &str, index: usize) -> i64 {
        match name {
            "master" => i64::from(self.volume.master),
            "music" => i64::from(self.volume.music),
            "groups" => i64::from(self.volume.groups[index]),
            "tempo_base" => i64::from(self.tempo_base),
            "queue" => {
                i64::from(self.queue.entries[index / ENTRY_WORDS].to_words()[index % ENTRY_WORDS])
            }
            "queue_read" => self.queue.read as i64,
            "queue_write" => self.queue.write as i64,
            "queue_adding" => i64::from(self.queue.adding),
            "trigger_count" => i64::from(self.queue.trigger_count),
            "recording_sound" => self.queue.recording.map(|(s, _)| i64::from(s)).unwrap_or(-1),
            "recording_marker" => self.queue.recording.map(|(_, m)| i64::from(m)).unwrap_or(0),
            "triggers" => i64::from(
                trigger_words(self.triggers.entries[index / TRIGGER_WORDS])[index % TRIGGER_WORDS],
            ),
            "trigger_clock" => i64::from(self.triggers.clock),
            "deferred" => i64::from(
                deferred_words(self.deferred.slots[index / DEFERRED_WORDS])
                    [index % DEFERRED_WORDS],
            ),
            _ => 0,
        }
    }

    fn load_field(&mut self, name: &str, index: usize, value: i64) {
        match name {
            "master" => self.volume.master = value as u8,
            "music" => self.volume.music = value as u8,
            "groups" => self.volume.groups[index] = (value as u8).min(127),
            "tempo_base" => self.tempo_base = (value as u32).clamp(50, 200),
            "queue" => set_word(
                &mut self.queue.entries[index / ENTRY_WORDS],
                index % ENTRY_WORDS,
                value,
                QueueEntry::to_words,
                QueueEntry::from_words,
            ),
            "queue_read" => self.queue.read = (value as usize) % QUEUE_SIZE,
            "queue_write" => self.queue.write = (value as usize) % QUEUE_SIZE,
            "queue_adding" => self.queue.adding = value != 0,
            "trigger_count" => self.queue.trigger_count = value as u32,
            "recording_sound" => {
                self.queue.recording = SoundId::try_from(value).ok().map(|sound| (sound, 0))
            }
            "recording_marker" => {
                if let Some((_, marker)) = self.queue.recording.as_mut() {
                    *marker = value as u8;
                }
            }
            "triggers" => set_word(
                &mut self.triggers.entries[index / TRIGGER_WORDS],
                index % TRIGGER_WORDS,
                value,
                trigger_words,
                trigger_from_words,
            ),
            "trigger_clock" => self.triggers.clock = value as u32,
            "deferred" => set_word(
                &mut self.deferred.slots[index / DEFERRED_WORDS],
                index % DEFERRED_WORDS,
                value,
                deferred_words,
                deferred_from_words,
            ),
            _ => {}
        }
    }
}

const FADER_WORDS: usize = 5;

fn fader_words(fader: Option<Fader>) -> [i32; FADER_WORDS] {
    match fader {
        None => [0; FADER_WORDS],
        Some(fader) => [
            fader.kind as i32,
            fader.start,
            fader.end,
            fader.total as i32,
            fader.elapsed as i32,
        ],
    }
}

fn fader_from_words(words: [i32; FADER_WORDS]) -> Option<Fader> {
    let kind = FadeKind::try_from(words[0]).ok()?;
    Some(Fader {
        kind,
        start: words[1],
        end: words[2],
        total: words[3] as u32,
        elapsed: words[4] as u32,
    })
}

impl Saveable for Player {
    const FIELDS: &'static [Field] = &[
        Field::new("active", FieldKind::Bool, 1),
        Field::new("sound", FieldKind::U16, 1),
        Field::new("priority", FieldKind::U8, 1),
        Field::new("volume", FieldKind::U8, 1),
        Field::new("pan", FieldKind::I8, 1),
        Field::new("transpose", FieldKind::I8, 1),
        Field::new("tick", FieldKind::U32, 1),
        Field::new("tempo", FieldKind::U32, 1),
        Field::new("loop_count", FieldKind::U16, 1),
        Field::new("loop_to_beat", FieldKind::U16, 1),
        Field::new("loop_to_tick", FieldKind::U16, 1),
        Field::new("loop_from_beat", FieldKind::U16, 1),
        Field::new("loop_from_tick", FieldKind::U16, 1),
        Field::new("speed", FieldKind::U8, 2),
        Field::new("detune", FieldKind::I8, 2),
        Field::new("group", FieldKind::U8, 2),
        Field::array("faders", FieldKind::I32, MAX_FADERS * FADER_WORDS, 3),
        Field::array("hook_jump", FieldKind::U8, 2, 3),
        Field::new("hook_transpose", FieldKind::U8, 3),
        Field::array("hook_part_onoff", FieldKind::U8, 16, 3),
        Field::array("hook_part_volume", FieldKind::U8, 16, 3),
        Field::array("hook_part_program", FieldKind::U8, 16, 3),
        Field::array("hook_part_transpose", FieldKind::U8, 16, 3),
        Field::new("cursor", FieldKind::U32, CURSOR_VERSION),
    ];

    fn save_field(&self, name: &str, index: usize) -> i64 {
        let looping = self.looping.unwrap_or_default();
        match name {
            "active" => i64::from(self.active),
            "sound" => i64::from(self.id),
            "priority" => i64::from(self.priority),
            "volume" => i64::from(self.volume),
            "pan" => i64::from(self.pan),
            "transpose" => i64::from(self.transpose),
            "tick" => i64::from(self.sequencer.tick),
            "tempo" => i64::from(self.sequencer.tempo),
            "loop_count" => i64::from(looping.count),
            "loop_to_beat" => i64::from(looping.to_beat),
            "loop_to_tick" => i64::from(looping.to_tick),
            "loop_from_beat" => i64::from(looping.from_beat),
            "loop_from_tick" => i64::from(looping.from_tick),
            "speed" => i64::from(self.speed),
            "detune" => i64::from(self.detune),
            "group" => i64::from(self.group),
            "faders" => i64::from(
                fader_words(self.faders.slots[index / FADER_WORDS])[index % FADER_WORDS],
            ),
            "hook_jump" => i64::from(self.hooks.jump[index]),
            "hook_transpose" => i64::from(self.hooks.transpose),
            "hook_part_onoff" => i64::from(self.hooks.part_onoff[index]),
            "hook_part_volume" => i64::from(self.hooks.part_volume[index]),
            "hook_part_program" => i64::from(self.hooks.part_program[index]),
            "hook_part_transpose" => i64::from(self.hooks.part_transpose[index]),
            "cursor" => self.sequencer.cursor as i64,
            _ => 0,
        }
    }

    fn load_field(&mut self, name: &str, index: usize, value: i64) {
        if let Some(field) = name.strip_prefix("loop_") {
            let looping = self.looping.get_or_insert_with(Loop::default);
            match field {
                "count" => looping.count = value as u16,
                "to_beat" => looping.to_beat = value as u16,
                "to_tick" => looping.to_tick = value as u16,
                "from_beat" => looping.from_beat = value as u16,
                "from_tick" => looping.from_tick = value as u16,
                _ => {}
            }
            return;
        }
        match name {
            "active" => self.active = value != 0,
            "sound" => self.id = value as SoundId,
            "priority" => self.priority = value as u8,
            "volume" => self.volume = (value as u8).min(127),
            "pan" => self.pan = (value as i8).max(-64),
            "transpose" => self.transpose = (value as i8).clamp(-24, 24),
            "tick" => self.sequencer.tick = value as u32,
            "tempo" => self.sequencer.tempo = (value as u32).max(1),
            "speed" => self.speed = value as u8,
            "detune" => self.detune = value as i8,
            "group" => self.group = (value as u8).min(VOLUME_GROUPS as u8 - 1),
            "faders" => set_word(
                &mut self.faders.slots[index / FADER_WORDS],
                index % FADER_WORDS,
                value,
                fader_words,
                fader_from_words,
            ),
            "hook_jump" => self.hooks.jump[index] = value as u8,
            "hook_transpose" => self.hooks.transpose = value as u8,
            "hook_part_onoff" => self.hooks.part_onoff[index] = value as u8,
            "hook_part_volume" => self.hooks.part_volume[index] = value as u8,
            "hook_part_program" => self.hooks.part_program[index] = value as u8,
            "hook_part_transpose" => self.hooks.part_transpose[index] = value as u8,
            "cursor" => self.sequencer.cursor = value as usize,
            _ => {}
        }
    }
}

impl Saveable for Part {
    const FIELDS: &'static [Field] = &[
        Field::new("player", FieldKind::U8, 1),
        Field::new("channel", FieldKind::U8, 1),
        Field::new("enabled", FieldKind::Bool, 1),
        Field::new("percussion", FieldKind::Bool, 1),
        Field::new("volume", FieldKind::U8, 1),
        Field::new("volume_eff", FieldKind::U8, 1).until(2),
        Field::new("pan", FieldKind::I8, 1),
        Field::new("transpose", FieldKind::I8, 1),
        Field::new("detune", FieldKind::I8, 1),
        Field::new("priority", FieldKind::I8, 1),
        Field::new("hw_channel", FieldKind::U8, 1).until(2),
        Field::new("pitch_bend", FieldKind::I16, 1),
        Field::new("pitch_bend_factor", FieldKind::U8, 1),
        Field::new("modulation", FieldKind::U8, 1),
        Field::new("sustain", FieldKind::Bool, 1),
        Field::new("effect_level", FieldKind::U8, 1),
        Field::new("chorus", FieldKind::U8, 1),
        Field::new("program", FieldKind::U8, 1),
    ];

    fn save_field(&self, name: &str, _index: usize) -> i64 {
        match name {
            "player" => self.player.map(|pid| pid as i64).unwrap_or(NO_INDEX),
            "channel" => i64::from(self.channel),
            "enabled" => i64::from(self.enabled),
            "percussion" => i64::from(self.percussion),
            "volume" => i64::from(self.volume),
            "volume_eff" => i64::from(self.volume_eff),
            "pan" => i64::from(self.pan),
            "transpose" => i64::from(self.transpose),
            "detune" => i64::from(self.detune),
            "priority" => i64::from(self.priority),
            "hw_channel" => self.hw.map(|hw| i64::from(hw.as_int())).unwrap_or(NO_INDEX),
            "pitch_bend" => i64::from(self.pitch_bend),
            "pitch_bend_factor" => i64::from(self.pitch_bend_factor),
            "modulation" => i64::from(self.modulation),
            "sustain" => i64::from(self.sustain),
            "effect_level" => i64::from(self.effect_level),
            "chorus" => i64::from(self.chorus),
            "program" => self.program.map(i64::from).unwrap_or(NO_INDEX),
            _ => 0,
        }
    }

    fn load_field(&mut self, name: &str, _index: usize, value: i64) {
        match name {
            "player" => self.player = (value != NO_INDEX).then_some(value as usize),
            "channel" => self.channel = (value as u8) & 0x0F,
            "enabled" => self.enabled = value != 0,
            "percussion" => self.percussion = value != 0,
            "volume" => self.volume = (value as u8).min(127),
            "pan" => self.pan = (value as i8).max(-64),
            "transpose" => self.transpose = value as i8,
            "detune" => self.detune = value as i8,
            "priority" => self.priority = value as i8,
            "pitch_bend" => self.pitch_bend = (value as i16).clamp(-8192, 8191),
            "pitch_bend_factor" => self.pitch_bend_factor = value as u8,
            "modulation" => self.modulation = value as u8,
            "sustain" => self.sustain = value != 0,
            "effect_level" => self.effect_level = value as u8,
            "chorus" => self.chorus = value as u8,
            "program" => self.program = (value != NO_INDEX).then_some((value as u8) & 0x7F),
            _ => {}
        }
    }
}

impl Engine {
    /// Saves the engine in the current format.
    pub fn save(&self) -> Vec<u8> {
        self.save_version(CURRENT_VERSION)
    }

    /// Saves the engine in the format of an earlier version. Fields that version didn't have
    /// are left out.
    pub fn save_version(&self, version: u16) -> Vec<u8> {
        let globals = Globals {
            volume: self.volume.clone(),
            tempo_base: self.properties.tempo_base,
            queue: self.queue.clone(),
            triggers: self.triggers.clone(),
            deferred: self.deferred.clone(),
        };

        let mut writer = Writer { bytes: Vec::new() };
        writer.bytes.extend(MAGIC);
        writer.bytes.extend(version.to_le_bytes());
        writer.record(&globals, version);
        writer.put(FieldKind::U8, self.players.len() as i64);
        for player in self.players.iter() {
            writer.record(player, version);
        }
        writer.put(FieldKind::U8, self.parts.len() as i64);
        for part in self.parts.iter() {
            writer.record(part, version);
        }
        writer.bytes
    }

    /// Replaces the engine state with a saved one. Nothing changes if the stream fails to
    /// parse.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), SaveError> {
        let mut reader = Reader { bytes, position: 0 };
        if &reader.take::<4>()? != MAGIC {
            return Err(SaveError::BadMagic);
        }
        let version = u16::from_le_bytes(reader.take()?);
        if version == 0 || version > CURRENT_VERSION {
            return Err(SaveError::UnsupportedVersion(version));
        }

        let mut globals = Globals {
            tempo_base: self.properties.tempo_base,
            ..Globals::default()
        };
        reader.record(&mut globals, version)?;

        let player_count = reader.get(FieldKind::U8)?;
        if player_count as usize > MAX_PLAYERS {
            return Err(SaveError::IndexOutOfRange {
                what: "player count",
                index: player_count,
            });
        }
        let mut players = vec![Player::default(); MAX_PLAYERS];
        for player in players.iter_mut().take(player_count as usize) {
            reader.record(player, version)?;
            if player.looping.is_some_and(|looping| looping.count == 0) {
                player.looping = None;
            }
        }

        let part_count = reader.get(FieldKind::U8)?;
        if part_count as usize > MAX_PARTS {
            return Err(SaveError::IndexOutOfRange {
                what: "part count",
                index: part_count,
            });
        }
        let mut parts = vec![Part::default(); MAX_PARTS];
        for part in parts.iter_mut().take(part_count as usize) {
            reader.record(part, version)?;
            if let Some(pid) = part.player {
                if pid >= MAX_PLAYERS {
                    return Err(SaveError::IndexOutOfRange {
                        what: "player",
                        index: pid as i64,
                    });
                }
            }
        }

        self.teardown();
        self.volume = globals.volume;
        self.properties.tempo_base = globals.tempo_base;
        self.queue = globals.queue;
        self.triggers = globals.triggers;
        self.deferred = globals.deferred;
        self.players = players;
        self.parts = parts;
        self.relink(version);
        info!(version, "Loaded engine state.");
        Ok(())
    }

    /// Silences and forgets the current state without firing triggers.
    fn teardown(&mut self) {
        for part in self.parts.iter_mut() {
            part.uninit(self.device.as_ref());
        }
        for player in self.players.iter_mut() {
            player.reset();
        }
    }

    /// Rebuilds the links a stream doesn't carry: sounds, the players' part tables, effective
    /// values and channel bindings.
    fn relink(&mut self, version: u16) {
        for player in self.players.iter_mut() {
            player.parts = Default::default();
            if !player.active {
                player.reset();
                continue;
            }
            match self.library.sound(player.id) {
                Some(sound) => {
                    let events = sound.events();
                    let sequencer = &mut player.sequencer;
                    let consistent = sequencer.cursor <= events.len()
                        && sequencer
                            .cursor
                            .checked_sub(1)
                            .is_none_or(|last| events[last].tick <= sequencer.tick);
                    if version < CURSOR_VERSION || !consistent {
                        let tick = sequencer.tick;
                        sequencer.resume(events, tick);
                    }
                    player.sound = Some(sound);
                }
                None => {
                    warn!(sound = player.id, "Saved sound is missing, dropping its player.");
                    player.reset();
                }
            }
        }

        for part_id in 0..MAX_PARTS {
            let part = &mut self.parts[part_id];
            part.hw = None;
            part.notes = 0;
            part.sent = [None; 128];
            let Some(pid) = part.player else {
                *part = Part::default();
                continue;
            };
            let channel = usize::from(part.channel);
            let player = &mut self.players[pid];
            if !player.active || player.parts[channel].is_some() {
                *part = Part::default();
                continue;
            }
            player.parts[channel] = Some(part_id);
        }

        for part_id in 0..MAX_PARTS {
            self.refresh_part(part_id);
        }
        self.reallocate_channels();
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, error::Error};

    use midly::MidiMessage;

    use crate::{
        engine::{
            test::{engine, sound},
            Command, FadeKind, HookClass,
        },
        sound::Sound,
        synth::{ChannelId, MockDevice as Device},
        testutil::SmfBuilder,
    };

    use super::{SaveError, CURRENT_VERSION};

    fn scenario(device: &Device) -> Result<crate::engine::Engine, Box<dyn Error>> {
        let mut engine = engine(
            device,
            vec![
                sound(1, 100, &[0, 1, 2])?,
                sound(2, 60, &[0, 3, 9])?,
                sound(3, 80, &[4])?,
            ],
        );
        for id in 1..=3 {
            engine.start_sound(id)?;
        }
        for _ in 0..5 {
            engine.on_timer();
        }
        let first = engine.find_player(1).unwrap();
        let second = engine.find_player(2).unwrap();
        engine.set_master_volume(200);
        engine.set_group_volume(2, 90)?;
        engine.set_player_group(second, 2)?;
        engine.set_player_volume(first, 70)?;
        engine.set_player_pan(first, -12)?;
        engine.set_player_transpose(second, false, 3);
        engine.set_player_detune(second, -20);
        engine.set_part_volume(first, 1, 33);
        engine.set_part_transpose(first, 2, false, -5);
        engine.set_player_priority(second, 120)?;
        engine.add_fade(first, FadeKind::Volume, 10, 100)?;
        engine.do_command(Command::new(0x10C, &[1, HookClass::PartVolume as i32, 7, 16]))?;
        engine.do_command(Command::new(0x10E, &[3, 4]))?;
        engine.do_command(Command::new(0x10F, &[0x08, 1]))?;
        engine.do_command(Command::new(0x10F, &[-1]))?;
        engine.do_command(Command::new(0x13, &[2, 6, 0x09, 3]))?;
        engine.schedule(50, Command::new(0x09, &[1]));
        Ok(engine)
    }

    fn effective(engine: &crate::engine::Engine) -> Vec<(Option<usize>, u8, i8, i8, i8, u8)> {
        engine
            .parts()
            .iter()
            .map(|part| {
                (
                    part.player,
                    part.volume_eff,
                    part.pan_eff,
                    part.transpose_eff,
                    part.detune_eff,
                    part.pri_eff,
                )
            })
            .collect()
    }

    fn bound_parts(engine: &crate::engine::Engine) -> HashSet<usize> {
        engine
            .parts()
            .iter()
            .enumerate()
            .filter(|(_, part)| part.hw.is_some())
            .map(|(part_id, _)| part_id)
            .collect()
    }

    #[test]
    fn round_trip() -> Result<(), Box<dyn Error>> {
        let device = Device::with_channels("mock", 5);
        let original = scenario(&device)?;
        let saved = original.save();

        let restored_device = Device::with_channels("mock", 5);
        let mut restored = engine(
            &restored_device,
            vec![
                sound(1, 100, &[0, 1, 2])?,
                sound(2, 60, &[0, 3, 9])?,
                sound(3, 80, &[4])?,
            ],
        );
        restored.load(&saved)?;
        restored.check_invariants()?;

        assert_eq!(effective(&original), effective(&restored));
        assert_eq!(bound_parts(&original), bound_parts(&restored));
        assert_eq!(original.volume, restored.volume);
        assert_eq!(original.triggers, restored.triggers);
        assert_eq!(original.deferred, restored.deferred);
        assert_eq!(original.queue.query(0), restored.queue.query(0));
        assert_eq!(original.queue.entries, restored.queue.entries);
        for (before, after) in original.players().iter().zip(restored.players()) {
            assert_eq!(before.active, after.active);
            assert_eq!(before.id, after.id);
            assert_eq!(before.sequencer.tick, after.sequencer.tick);
            assert_eq!(before.sequencer.cursor, after.sequencer.cursor);
            assert_eq!(before.faders, after.faders);
            assert_eq!(before.hooks, after.hooks);
            assert_eq!(before.parts, after.parts);
        }

        // Saving what was loaded gives the same stream.
        assert_eq!(saved, restored.save());

        // Playing on doesn't repeat what already played.
        restored_device.clear_messages();
        restored.on_timer();
        assert!(note_ons(&restored_device).is_empty());
        Ok(())
    }

    fn note_ons(device: &Device) -> Vec<(ChannelId, u8)> {
        device
            .messages()
            .into_iter()
            .filter_map(|(channel, message)| match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    Some((channel, key.as_int()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn load_does_not_replay_events() -> Result<(), Box<dyn Error>> {
        let bytes = SmfBuilder::new(96)
            .note(0, 0, 60, 100, 96)
            .note(1, 1, 64, 100, 96)
            .note(96, 2, 67, 100, 96)
            .build();
        let sounds = || Sound::parse(1, &bytes);

        let device = Device::get("mock");
        let mut original = engine(&device, vec![sounds()?]);
        original.start_sound(1)?;
        original.on_timer();
        assert_eq!(1, original.players()[0].sequencer.tick);
        assert_eq!(vec![(ChannelId(0), 60), (ChannelId(1), 64)], note_ons(&device));
        let saved = original.save();

        let restored_device = Device::get("mock");
        let mut restored = engine(&restored_device, vec![sounds()?]);
        restored.load(&saved)?;
        assert_eq!(
            original.players()[0].sequencer.cursor,
            restored.players()[0].sequencer.cursor
        );
        restored_device.clear_messages();
        for _ in 0..10 {
            restored.on_timer();
        }
        assert!(note_ons(&restored_device).is_empty());

        // Streams without cursors pick up after the saved tick.
        let mut old = engine(&Device::get("mock"), vec![sounds()?]);
        old.load(&original.save_version(4))?;
        assert_eq!(
            original.players()[0].sequencer.cursor,
            old.players()[0].sequencer.cursor
        );
        Ok(())
    }

    #[test]
    fn loads_first_version() -> Result<(), Box<dyn Error>> {
        let device = Device::with_channels("mock", 5);
        let original = scenario(&device)?;
        let saved = original.save_version(1);
        assert!(saved.len() < original.save().len());

        let mut restored = scenario(&Device::with_channels("mock", 5))?;
        restored.load(&saved)?;
        restored.check_invariants()?;

        let second = restored.find_player(2).unwrap();
        let player = &restored.players()[second];
        // Fields from later versions take their defaults.
        assert_eq!(0, player.detune);
        assert_eq!(0, player.group);
        assert_eq!(128, player.speed);
        assert!(player.faders.is_empty());
        assert_eq!(3, player.transpose);
        assert_eq!(120, player.priority);
        assert!(restored.triggers.is_empty());
        assert!(restored.deferred.is_empty());
        assert_eq!(1, restored.queue.query(0));
        Ok(())
    }

    #[test]
    fn missing_sounds_drop_players() -> Result<(), Box<dyn Error>> {
        let device = Device::with_channels("mock", 5);
        let saved = scenario(&device)?.save();

        let mut restored = engine(
            &Device::with_channels("mock", 5),
            vec![sound(1, 100, &[0, 1, 2])?],
        );
        restored.load(&saved)?;
        restored.check_invariants()?;
        assert_eq!(1, restored.sound_status(1));
        assert_eq!(0, restored.sound_status(2));
        assert_eq!(3, restored.parts().iter().filter(|p| p.player.is_some()).count());
        Ok(())
    }

    #[test]
    fn bad_streams() -> Result<(), Box<dyn Error>> {
        let device = Device::get("mock");
        let mut engine = scenario(&device)?;
        let saved = engine.save();

        assert_eq!(Err(SaveError::BadMagic), engine.load(b"MIDI\x04\x00"));
        let mut future = saved.clone();
        future[4..6].copy_from_slice(&(CURRENT_VERSION + 1).to_le_bytes());
        assert_eq!(
            Err(SaveError::UnsupportedVersion(CURRENT_VERSION + 1)),
            engine.load(&future)
        );
        assert_eq!(
            Err(SaveError::Truncated),
            engine.load(&saved[..saved.len() - 1])
        );

        // A failed load leaves the engine alone.
        assert_eq!(3, engine.players().iter().filter(|p| p.active).count());
        engine.check_invariants()?;
        Ok(())
    }
}
