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
use std::sync::Arc;

use crate::sound::{Sound, SoundId, DEFAULT_SOUND_PRIORITY};

use super::{fader::Faders, hook::Hooks, sequencer::Sequencer, PartId};

/// A player owns at most one part per track channel.
pub const MAX_PLAYER_PARTS: usize = 16;

pub const DEFAULT_SPEED: u8 = 128;

/// The player values its parts combine with their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayerContext {
    pub priority: u8,
    pub volume: u8,
    pub pan: i8,
    pub transpose: i8,
    pub detune: i8,
    pub group: u8,
}

/// A pending loop. Reaching the `from` point jumps back to `to` until the count runs out.
/// Beats are one based, ticks are within the beat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Loop {
    pub count: u16,
    pub to_beat: u16,
    pub to_tick: u16,
    pub from_beat: u16,
    pub from_tick: u16,
}

impl Loop {
    pub fn to_position(&self, ticks_per_beat: u16) -> u32 {
        position(self.to_beat, self.to_tick, ticks_per_beat)
    }

    pub fn from_position(&self, ticks_per_beat: u16) -> u32 {
        position(self.from_beat, self.from_tick, ticks_per_beat)
    }
}

/// Converts a one based beat and a tick within it into an absolute tick.
pub fn position(beat: u16, tick: u16, ticks_per_beat: u16) -> u32 {
    u32::from(beat.saturating_sub(1)) * u32::from(ticks_per_beat) + u32::from(tick)
}

/// One playback slot.
#[derive(Clone, Debug)]
pub struct Player {
    pub active: bool,
    pub id: SoundId,
    pub sound: Option<Arc<Sound>>,

    pub priority: u8,
    pub volume: u8,
    pub pan: i8,
    pub transpose: i8,
    pub detune: i8,
    pub speed: u8,
    /// Index into the engine's volume groups.
    pub group: u8,

    /// Parts by track channel.
    pub parts: [Option<PartId>; MAX_PLAYER_PARTS],
    pub sequencer: Sequencer,
    pub hooks: Hooks,
    pub faders: Faders,
    pub looping: Option<Loop>,

    /// Bumped whenever the playback position changes discontinuously, so a dispatch loop can
    /// tell its cursor went stale.
    pub generation: u32,
}

impl Default for Player {
    fn default() -> Self {
        Player {
            active: false,
            id: 0,
            sound: None,
            priority: DEFAULT_SOUND_PRIORITY,
            volume: 127,
            pan: 0,
            transpose: 0,
            detune: 0,
            speed: DEFAULT_SPEED,
            group: 0,
            parts: [None; MAX_PLAYER_PARTS],
            sequencer: Sequencer::default(),
            hooks: Hooks::default(),
            faders: Faders::default(),
            looping: None,
            generation: 0,
        }
    }
}

impl Player {
    /// Resets the slot to play the given sound from the top.
    pub fn start(&mut self, sound: Arc<Sound>) {
        let generation = self.generation.wrapping_add(1);
        *self = Player {
            active: true,
            id: sound.id(),
            priority: sound.priority(),
            sound: Some(sound),
            generation,
            ..Player::default()
        };
    }

    /// Marks the slot free. Parts must have been released already.
    pub fn reset(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Player {
            generation,
            ..Player::default()
        };
    }

    pub fn context(&self) -> PlayerContext {
        PlayerContext {
            priority: self.priority,
            volume: self.volume,
            pan: self.pan,
            transpose: self.transpose,
            detune: self.detune,
            group: self.group,
        }
    }

    pub fn ticks_per_beat(&self) -> u16 {
        self.sound
            .as_ref()
            .map(|sound| sound.ticks_per_beat())
            .unwrap_or(1)
            .max(1)
    }

    /// The current one based beat and the tick within it.
    pub fn beat_and_tick(&self) -> (u32, u32) {
        let ticks_per_beat = u32::from(self.ticks_per_beat());
        (
            self.sequencer.tick / ticks_per_beat + 1,
            self.sequencer.tick % ticks_per_beat,
        )
    }

    pub fn set_transpose(&mut self, relative: bool, value: i32) {
        let value = if relative {
            i32::from(self.transpose) + value
        } else {
            value
        };
        self.transpose = value.clamp(-24, 24) as i8;
    }

    /// Owned part ids in track channel order.
    pub fn part_ids(&self) -> impl Iterator<Item = PartId> + '_ {
        self.parts.iter().flatten().copied()
    }

    pub fn owns(&self, sound: SoundId) -> bool {
        self.active && self.id == sound
    }
}
