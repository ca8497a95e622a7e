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
use crate::{
    sound::PartSetup,
    synth::{ChannelId, Device, GM_PERCUSSION_CHANNEL},
};

use super::{player::PlayerContext, volume::Volume, PlayerId};

const DEFAULT_PITCH_BEND_FACTOR: u8 = 2;
const DEFAULT_EFFECT_LEVEL: u8 = 64;

/// One logical track of a player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// The owning player. None means the part is free.
    pub player: Option<PlayerId>,
    /// The track channel from the music data.
    pub channel: u8,
    /// The device channel this part is bound to.
    pub hw: Option<ChannelId>,
    pub enabled: bool,
    pub percussion: bool,

    pub volume: u8,
    pub pan: i8,
    pub transpose: i8,
    pub detune: i8,
    pub priority: i8,

    pub volume_eff: u8,
    pub pan_eff: i8,
    pub transpose_eff: i8,
    pub detune_eff: i8,
    pub pri_eff: u8,

    pub pitch_bend: i16,
    pub pitch_bend_factor: u8,
    pub modulation: u8,
    pub sustain: bool,
    pub effect_level: u8,
    pub chorus: u8,
    pub program: Option<u8>,

    /// Notes currently sounding, by the note number actually sent.
    pub notes: u128,
    /// The note sent for each key of the music data. Note offs release this
    /// note, whatever the transpose is by then.
    pub sent: [Option<u8>; 128],
}

impl Default for Part {
    fn default() -> Self {
        Part {
            player: None,
            channel: 0,
            hw: None,
            enabled: true,
            percussion: false,
            volume: 127,
            pan: 0,
            transpose: 0,
            detune: 0,
            priority: 0,
            volume_eff: 127,
            pan_eff: 0,
            transpose_eff: 0,
            detune_eff: 0,
            pri_eff: 0,
            pitch_bend: 0,
            pitch_bend_factor: DEFAULT_PITCH_BEND_FACTOR,
            modulation: 0,
            sustain: false,
            effect_level: DEFAULT_EFFECT_LEVEL,
            chorus: 0,
            program: None,
            notes: 0,
            sent: [None; 128],
        }
    }
}

impl Part {
    /// Prepares a free part for a player's track channel.
    pub fn setup(&mut self, player: PlayerId, channel: u8) {
        *self = Part {
            player: Some(player),
            channel,
            percussion: channel == GM_PERCUSSION_CHANNEL,
            ..Part::default()
        };
    }

    /// Applies the base values of a part setup message.
    pub fn apply_setup(&mut self, setup: &PartSetup) {
        self.enabled = setup.enabled;
        self.percussion = setup.percussion;
        self.priority = setup.priority;
        self.volume = setup.volume;
        self.pan = setup.pan.clamp(-64, 63);
        self.transpose = setup.transpose;
        self.detune = setup.detune;
        if setup.program.is_some() {
            self.program = setup.program;
        }
    }

    /// Returns true if the part wants a melodic device channel.
    pub fn wants_channel(&self) -> bool {
        self.player.is_some() && self.enabled && !self.percussion
    }

    /// Recomputes the effective values from the owning player and the engine volume layers.
    pub fn recompute(&mut self, player: &PlayerContext, volume: &Volume) {
        self.volume_eff = volume.effective(player.group, player.volume, self.volume);
        self.pan_eff = (i16::from(self.pan) + i16::from(player.pan)).clamp(-64, 63) as i8;
        self.pri_eff = (i16::from(self.priority) + i16::from(player.priority)).clamp(0, 255) as u8;
        self.transpose_eff = if self.percussion {
            0
        } else {
            (i16::from(self.transpose) + i16::from(player.transpose)).clamp(-24, 24) as i8
        };
        self.detune_eff = (i16::from(self.detune) + i16::from(player.detune)).clamp(-128, 127) as i8;
    }

    /// The pitch bend sent to the device: the music's bend plus the detune, which is in 1/64ths
    /// of a semitone and scaled to the bend range.
    pub fn effective_bend(&self) -> i16 {
        let factor = i32::from(self.pitch_bend_factor.max(1));
        let detune = i32::from(self.detune_eff) * 8192 / (64 * factor);
        (i32::from(self.pitch_bend) + detune).clamp(-8192, 8191) as i16
    }

    /// The channel notes go to right now, if any.
    fn note_channel(&self, device: &dyn Device) -> Option<ChannelId> {
        if self.percussion {
            device.percussion_channel()
        } else {
            self.hw
        }
    }

    pub fn note_on(&mut self, device: &dyn Device, key: u8, velocity: u8) {
        if !self.enabled {
            return;
        }
        let Some(channel) = self.note_channel(device) else {
            return;
        };
        let note = (i16::from(key) + i16::from(self.transpose_eff)).clamp(0, 127) as u8;

        if self.percussion {
            // The percussion channel is shared, so claim it with this part's state first.
            device.volume(channel, self.volume_eff);
            if let Some(program) = self.program {
                device.program_change(channel, program);
            }
        }
        // A retriggered key releases its old note first if the transpose moved it.
        if let Some(previous) = self.sent[usize::from(key & 0x7F)].replace(note) {
            if previous != note {
                self.notes &= !(1u128 << previous);
                device.note_off(channel, previous);
            }
        }
        device.note_on(channel, note, velocity);
        self.notes |= 1u128 << note;
    }

    pub fn note_off(&mut self, device: &dyn Device, key: u8) {
        let Some(note) = self.sent[usize::from(key & 0x7F)].take() else {
            return;
        };
        if self.notes & (1u128 << note) == 0 {
            return;
        }
        self.notes &= !(1u128 << note);
        if let Some(channel) = self.note_channel(device) {
            device.note_off(channel, note);
        }
    }

    /// Sends a note off for every sounding note.
    pub fn silence(&mut self, device: &dyn Device) {
        if let Some(channel) = self.note_channel(device) {
            for note in 0..128u8 {
                if self.notes & (1u128 << note) != 0 {
                    device.note_off(channel, note);
                }
            }
        }
        self.notes = 0;
        self.sent = [None; 128];
    }

    /// Binds the part to a device channel and replays its full state onto it.
    pub fn bind(&mut self, device: &dyn Device, channel: ChannelId) {
        self.hw = Some(channel);
        self.notes = 0;
        self.sent = [None; 128];
        self.send_all(device);
    }

    /// Silences the part and gives its device channel back.
    pub fn unbind(&mut self, device: &dyn Device) {
        self.silence(device);
        if let Some(channel) = self.hw.take() {
            device.release_channel(channel);
        }
    }

    /// Returns the part to the pool.
    pub fn uninit(&mut self, device: &dyn Device) {
        self.unbind(device);
        *self = Part::default();
    }

    /// Replays the whole channel state onto the bound channel.
    pub fn send_all(&self, device: &dyn Device) {
        let Some(channel) = self.hw else {
            return;
        };
        device.pitch_bend_factor(channel, self.pitch_bend_factor);
        device.pitch_bend(channel, self.effective_bend());
        device.volume(channel, self.volume_eff);
        device.sustain(channel, self.sustain);
        device.modulation(channel, self.modulation);
        device.pan(channel, (i16::from(self.pan_eff) + 64) as u8);
        device.effect_level(channel, self.effect_level);
        if let Some(program) = self.program {
            device.program_change(channel, program);
        }
        device.chorus_level(channel, self.chorus);
        device.priority(channel, self.pri_eff);
    }

    /// Sends the values derived from the owning player.
    pub fn send_effective(&self, device: &dyn Device) {
        let Some(channel) = self.hw else {
            return;
        };
        device.volume(channel, self.volume_eff);
        device.pan(channel, (i16::from(self.pan_eff) + 64) as u8);
        device.pitch_bend(channel, self.effective_bend());
        device.priority(channel, self.pri_eff);
    }

    pub fn send_bend(&self, device: &dyn Device) {
        if let Some(channel) = self.hw {
            device.pitch_bend(channel, self.effective_bend());
        }
    }

    pub fn set_program(&mut self, device: &dyn Device, program: u8) {
        self.program = Some(program & 0x7F);
        if let Some(channel) = self.hw {
            device.program_change(channel, program & 0x7F);
        }
    }

    pub fn set_modulation(&mut self, device: &dyn Device, value: u8) {
        self.modulation = value;
        if let Some(channel) = self.hw {
            device.modulation(channel, value);
        }
    }

    pub fn set_sustain(&mut self, device: &dyn Device, on: bool) {
        self.sustain = on;
        if let Some(channel) = self.hw {
            device.sustain(channel, on);
        }
    }

    pub fn set_effect_level(&mut self, device: &dyn Device, value: u8) {
        self.effect_level = value;
        if let Some(channel) = self.hw {
            device.effect_level(channel, value);
        }
    }

    pub fn set_chorus(&mut self, device: &dyn Device, value: u8) {
        self.chorus = value;
        if let Some(channel) = self.hw {
            device.chorus_level(channel, value);
        }
    }

    pub fn set_pitch_bend_factor(&mut self, device: &dyn Device, semitones: u8) {
        self.pitch_bend_factor = semitones;
        if let Some(channel) = self.hw {
            device.pitch_bend_factor(channel, semitones);
            device.pitch_bend(channel, self.effective_bend());
        }
    }

    pub fn set_pitch_bend(&mut self, device: &dyn Device, bend: i16) {
        self.pitch_bend = bend;
        self.send_bend(device);
    }

    /// Forwards a controller the engine doesn't interpret.
    pub fn controller(&self, device: &dyn Device, controller: u8, value: u8) {
        if let Some(channel) = self.hw {
            device.controller(channel, controller, value);
        }
    }
}
