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

//! The numeric command protocol scripts drive the engine with. An opcode's
//! high byte selects the scope (0 global, 1 player) and its low byte the
//! command; up to six integer arguments follow.

use tracing::{debug, warn};

use crate::sound::SoundId;

use super::{
    hook::{HookClass, ALL_CHANNELS},
    Engine, FadeKind, MAX_PLAYERS,
};

/// The opcode that closes a trigger's command list.
pub const END_OF_LIST: i32 = -1;

const MAX_ARGS: usize = 6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Command {
    pub opcode: i32,
    pub args: [i32; MAX_ARGS],
}

impl Command {
    /// Creates a command. Missing arguments are zero, extra ones are dropped.
    pub fn new(opcode: i32, args: &[i32]) -> Command {
        let mut command = Command {
            opcode,
            args: [0; MAX_ARGS],
        };
        let count = args.len().min(MAX_ARGS);
        command.args[..count].copy_from_slice(&args[..count]);
        command
    }

    pub fn param(&self) -> i32 {
        self.opcode >> 8
    }

    pub fn cmd(&self) -> i32 {
        self.opcode & 0xFF
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unsupported opcode {0:#x}")]
    UnsupportedOpcode(i32),
    #[error("sound {0} is not in the library")]
    UnknownSound(i32),
    #[error("sound {0} is not playing")]
    NoSuchSound(i32),
    #[error("no player available for sound {0}")]
    Denied(i32),
    #[error("invalid {0}")]
    InvalidArgument(&'static str),
    #[error("no free fader")]
    NoFreeFader,
    #[error("command queue is full")]
    QueueFull,
    #[error("no trigger is being recorded")]
    NotRecording,
}

/// Engine wide tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Property {
    TempoBase,
    NativeMt32,
    MultiMidi,
    OldAdlibInstruments,
    LimitPlayers,
    RecyclePlayers,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Properties {
    /// Playback speed percentage for every player.
    pub tempo_base: u32,
    /// The device is a real MT-32, so MT-32 sounds keep their velocities.
    pub native_mt32: bool,
    pub multi_midi: bool,
    pub old_adlib_instruments: bool,
    pub player_limit: usize,
    /// Evict a player of equal priority when the pool is full.
    pub recycle_players: bool,
}

impl Default for Properties {
    fn default() -> Self {
        Properties {
            tempo_base: 100,
            native_mt32: false,
            multi_midi: false,
            old_adlib_instruments: false,
            player_limit: MAX_PLAYERS,
            recycle_players: false,
        }
    }
}

impl Properties {
    pub fn get(&self, property: Property) -> u32 {
        match property {
            Property::TempoBase => self.tempo_base,
            Property::NativeMt32 => u32::from(self.native_mt32),
            Property::MultiMidi => u32::from(self.multi_midi),
            Property::OldAdlibInstruments => u32::from(self.old_adlib_instruments),
            Property::LimitPlayers => self.player_limit as u32,
            Property::RecyclePlayers => u32::from(self.recycle_players),
        }
    }

    /// Sets a property and returns its previous value. Tempo base is clamped to 50..=200 and
    /// player limits outside 1..=8 are ignored.
    pub fn set(&mut self, property: Property, value: u32) -> u32 {
        let old = self.get(property);
        match property {
            Property::TempoBase => self.tempo_base = value.clamp(50, 200),
            Property::NativeMt32 => self.native_mt32 = value != 0,
            Property::MultiMidi => self.multi_midi = value != 0,
            Property::OldAdlibInstruments => self.old_adlib_instruments = value != 0,
            Property::LimitPlayers => {
                if (1..=MAX_PLAYERS as u32).contains(&value) {
                    self.player_limit = value as usize;
                }
            }
            Property::RecyclePlayers => self.recycle_players = value != 0,
        }
        old
    }
}

fn sound_id(value: i32) -> Result<SoundId, CommandError> {
    SoundId::try_from(value).map_err(|_| CommandError::NoSuchSound(value))
}

fn track_channel(value: i32) -> Result<u8, CommandError> {
    u8::try_from(value)
        .ok()
        .filter(|channel| *channel < 16)
        .ok_or(CommandError::InvalidArgument("channel"))
}

fn byte(value: i32, name: &'static str) -> Result<u8, CommandError> {
    u8::try_from(value).map_err(|_| CommandError::InvalidArgument(name))
}

fn ticks(value: i32) -> Result<u32, CommandError> {
    u32::try_from(value).map_err(|_| CommandError::InvalidArgument("duration"))
}

impl Engine {
    /// Runs a script command, returning its result.
    pub fn do_command(&mut self, command: Command) -> Result<i32, CommandError> {
        let result = match command.param() {
            0 => self.global_command(command),
            1 => self.player_command(command),
            _ => Err(CommandError::UnsupportedOpcode(command.opcode)),
        };
        if let Err(CommandError::UnsupportedOpcode(opcode)) = result {
            warn!(opcode, "Unsupported command.");
        }
        result
    }

    fn global_command(&mut self, command: Command) -> Result<i32, CommandError> {
        let a = command.args;
        match command.cmd() {
            0x06 => {
                let volume = u8::try_from(a[0])
                    .ok()
                    .filter(|volume| *volume <= 127)
                    .ok_or(CommandError::InvalidArgument("music volume"))?;
                self.set_music_volume((volume << 1) | (volume >> 6));
                Ok(0)
            }
            0x07 => Ok(i32::from(self.master_volume() / 2)),
            0x08 => {
                self.start_sound(sound_id(a[0])?)?;
                Ok(0)
            }
            0x09 => {
                self.stop_sound(sound_id(a[0])?);
                Ok(0)
            }
            0x0A | 0x0B => {
                self.stop_all_sounds();
                Ok(0)
            }
            0x0C => {
                if a[2] != 6 {
                    return Err(CommandError::InvalidArgument("volume parameter"));
                }
                let pid = self.active_player(a[0])?;
                self.set_player_volume(pid, a[3])?;
                Ok(0)
            }
            0x0D => Ok(self.sound_status(a[0])),
            0x0E => {
                let pid = self.active_player(a[0])?;
                self.add_fade(pid, FadeKind::try_from(a[2])?, a[3], ticks(a[4])?)?;
                Ok(0)
            }
            0x0F => {
                let pid = self.active_player(a[0])?;
                self.players[pid]
                    .hooks
                    .set(HookClass::Jump, byte(a[2], "hook value")?, 0)?;
                Ok(0)
            }
            0x10 => Ok(self.queue.query(a[0])),
            0x11 => {
                let pid = self.active_player(a[0])?;
                self.set_player_group(pid, a[1])?;
                Ok(0)
            }
            0x12 => {
                self.set_group_volume(a[0], a[1])?;
                Ok(0)
            }
            0x13 => {
                self.set_trigger(
                    sound_id(a[0])?,
                    byte(a[1], "marker")?,
                    Command::new(a[2], &a[3..]),
                );
                Ok(0)
            }
            0x14 => {
                let sound = (a[0] != -1).then(|| sound_id(a[0])).transpose()?;
                let marker = (a[1] != -1).then(|| byte(a[1], "marker")).transpose()?;
                Ok(self.triggers.clear(sound, marker) as i32)
            }
            0x15 => Ok(self.fire_all_triggers(sound_id(a[0])?) as i32),
            0x16 => {
                let hundredths = ticks(a[0])?;
                self.schedule(hundredths, Command::new(a[1], &a[2..]));
                Ok(0)
            }
            0x17 => {
                self.queue.clear();
                Ok(0)
            }
            0x18 => {
                self.set_master_volume(byte(a[0], "master volume")?);
                Ok(0)
            }
            _ => Err(CommandError::UnsupportedOpcode(command.opcode)),
        }
    }

    fn player_command(&mut self, command: Command) -> Result<i32, CommandError> {
        let a = command.args;

        // Queue operations don't need the sound to be playing.
        match command.cmd() {
            14 => {
                self.queue
                    .enqueue_trigger(sound_id(a[0])?, byte(a[1], "marker")?)?;
                return Ok(0);
            }
            15 => {
                self.queue.enqueue_command(Command::new(a[0], &a[1..]))?;
                return Ok(0);
            }
            16 => {
                self.queue.clear();
                return Ok(0);
            }
            23 => return Ok(self.queue.query(a[1])),
            0..=13 | 19 | 20 | 22 => {}
            _ => return Err(CommandError::UnsupportedOpcode(command.opcode)),
        }

        let pid = self.active_player(a[0])?;
        match command.cmd() {
            0 | 19 => return Ok(self.get_param(pid, a[1], a[2])),
            1 => self.set_player_priority(pid, a[1])?,
            2 => self.set_player_volume(pid, a[1])?,
            3 => self.set_player_pan(pid, a[1])?,
            4 => self.set_player_transpose(pid, a[1] != 0, a[2]),
            5 => self.set_player_detune(pid, a[1]),
            6 => self.set_player_speed(pid, a[1])?,
            7 => self.jump(pid, a[1], a[2], a[3])?,
            8 => self.scan(pid, a[1], a[2], a[3])?,
            9 => self.set_loop(pid, a[1], a[2], a[3], a[4], a[5])?,
            10 => self.clear_loop(pid),
            11 => self.set_part_enabled(pid, track_channel(a[1])?, a[2] != 0),
            12 | 20 => {
                let class = HookClass::try_from(a[1])?;
                let channel = u8::try_from(a[3])
                    .ok()
                    .filter(|channel| *channel <= ALL_CHANNELS)
                    .ok_or(CommandError::InvalidArgument("hook channel"))?;
                self.players[pid]
                    .hooks
                    .set(class, byte(a[2], "hook value")?, channel)?;
            }
            13 => self.add_fade(pid, FadeKind::Volume, a[1], ticks(a[2])?)?,
            22 => self.set_part_volume(pid, track_channel(a[1])?, byte(a[2], "part volume")?),
            _ => return Err(CommandError::UnsupportedOpcode(command.opcode)),
        }
        Ok(0)
    }

    /// Registers a trigger table entry. A start command for a sound that is already playing
    /// while its owner plays stops the target first, so the marker restarts it cleanly.
    pub fn set_trigger(&mut self, sound: SoundId, marker: u8, command: Command) {
        if command.param() == 0 && command.cmd() == 0x08 {
            if let Ok(target) = SoundId::try_from(command.args[0]) {
                if self.find_player(target).is_some() && self.find_player(sound).is_some() {
                    self.stop_sound(target);
                }
            }
        }
        debug!(sound, marker, opcode = command.opcode, "Set trigger.");
        self.triggers.set(sound, marker, command);
    }

    /// Fires every trigger the sound owns right now. Returns how many fired.
    pub fn fire_all_triggers(&mut self, sound: SoundId) -> usize {
        let commands = self.triggers.take_owned(sound);
        let count = commands.len();
        for command in commands {
            self.execute(command);
        }
        count
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use crate::{
        engine::test::{engine, sound},
        synth::{ChannelId, MockDevice as Device},
    };

    use super::{Command, CommandError, Properties, Property, END_OF_LIST};

    #[test]
    fn opcode_fields() {
        let command = Command::new(0x10C, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(1, command.param());
        assert_eq!(0x0C, command.cmd());
        assert_eq!([1, 2, 3, 4, 5, 6], command.args);
        assert_eq!(-1, Command::new(END_OF_LIST, &[]).param());
    }

    #[test]
    fn properties() {
        let mut properties = Properties::default();
        assert_eq!(100, properties.set(Property::TempoBase, 500));
        assert_eq!(200, properties.get(Property::TempoBase));
        properties.set(Property::TempoBase, 10);
        assert_eq!(50, properties.get(Property::TempoBase));

        assert_eq!(8, properties.set(Property::LimitPlayers, 3));
        assert_eq!(3, properties.set(Property::LimitPlayers, 9));
        assert_eq!(3, properties.get(Property::LimitPlayers));
        properties.set(Property::LimitPlayers, 0);
        assert_eq!(3, properties.get(Property::LimitPlayers));

        assert_eq!(0, properties.set(Property::NativeMt32, 5));
        assert_eq!(1, properties.get(Property::NativeMt32));
    }

    #[test]
    fn unsupported_opcodes() {
        let device = Device::get("mock");
        let mut engine = engine(&device, vec![]);
        for opcode in [0x00, 0x19, 0x2FF, END_OF_LIST, 0x1FF] {
            assert_eq!(
                Err(CommandError::UnsupportedOpcode(opcode)),
                engine.do_command(Command::new(opcode, &[]))
            );
        }
    }

    #[test]
    fn global_commands() -> Result<(), Box<dyn Error>> {
        let device = Device::get("mock");
        let mut engine = engine(&device, vec![sound(1, 100, &[0])?, sound(2, 90, &[1])?]);

        assert_eq!(0, engine.do_command(Command::new(0x08, &[1]))?);
        assert_eq!(1, engine.do_command(Command::new(0x0D, &[1]))?);
        assert!(engine.do_command(Command::new(0x08, &[7])).is_err());

        engine.do_command(Command::new(0x18, &[128]))?;
        assert_eq!(64, engine.do_command(Command::new(0x07, &[]))?);
        engine.do_command(Command::new(0x06, &[127]))?;
        assert_eq!(255, engine.music_volume());
        engine.do_command(Command::new(0x06, &[64]))?;
        assert_eq!(129, engine.music_volume());
        assert!(engine.do_command(Command::new(0x06, &[128])).is_err());

        engine.do_command(Command::new(0x0C, &[1, 0, 6, 40]))?;
        let pid = engine.find_player(1).unwrap();
        assert_eq!(40, engine.players()[pid].volume);
        assert!(engine.do_command(Command::new(0x0C, &[1, 0, 5, 40])).is_err());

        engine.do_command(Command::new(0x11, &[1, 3]))?;
        assert_eq!(3, engine.players()[pid].group);
        assert!(engine.do_command(Command::new(0x12, &[8, 10])).is_err());

        engine.do_command(Command::new(0x0E, &[1, 0, 4, 200, 10]))?;
        assert_eq!(1, engine.players()[pid].faders.slots.iter().flatten().count());

        engine.do_command(Command::new(0x08, &[2]))?;
        engine.do_command(Command::new(0x0A, &[]))?;
        assert_eq!(0, engine.do_command(Command::new(0x0D, &[-1]))?);
        Ok(())
    }

    #[test]
    fn player_commands() -> Result<(), Box<dyn Error>> {
        let device = Device::get("mock");
        let mut engine = engine(&device, vec![sound(1, 100, &[0])?]);
        assert_eq!(
            Err(CommandError::NoSuchSound(1)),
            engine.do_command(Command::new(0x101, &[1, 50]))
        );
        engine.start_sound(1)?;
        engine.on_timer();

        engine.do_command(Command::new(0x101, &[1, 50]))?;
        engine.do_command(Command::new(0x103, &[1, -20]))?;
        engine.do_command(Command::new(0x104, &[1, 0, 5]))?;
        engine.do_command(Command::new(0x104, &[1, 1, 2]))?;
        engine.do_command(Command::new(0x105, &[1, 10]))?;
        engine.do_command(Command::new(0x106, &[1, 64]))?;
        engine.do_command(Command::new(0x116, &[1, 0, 90]))?;
        engine.do_command(Command::new(0x10B, &[1, 2, 0]))?;

        let get = |engine: &mut crate::engine::Engine, param: i32, channel: i32| {
            engine.do_command(Command::new(0x113, &[1, param, channel]))
        };
        assert_eq!(50, get(&mut engine, 0, 0)?);
        assert_eq!(-20, get(&mut engine, 2, 0)?);
        assert_eq!(7, get(&mut engine, 3, 0)?);
        assert_eq!(10, get(&mut engine, 4, 0)?);
        assert_eq!(64, get(&mut engine, 5, 0)?);
        assert_eq!(90, get(&mut engine, 15, 0)?);
        assert_eq!(0, get(&mut engine, 14, 2)?);
        assert_eq!(129, get(&mut engine, 14, 5)?);
        assert_eq!(-1, get(&mut engine, 99, 0)?);

        // Pan -20 on the player shows up on the bound channel.
        assert_eq!(Some(44), device.last_controller(ChannelId(0), 10));

        assert!(engine.do_command(Command::new(0x103, &[1, 64])).is_err());
        assert!(engine.do_command(Command::new(0x10B, &[1, 16, 0])).is_err());
        assert!(engine.do_command(Command::new(0x10C, &[1, 9, 1, 0])).is_err());
        Ok(())
    }

    #[test]
    fn fire_all_triggers_counts() -> Result<(), Box<dyn Error>> {
        let device = Device::get("mock");
        let mut engine = engine(&device, vec![sound(1, 100, &[0])?, sound(2, 100, &[1])?]);
        engine.do_command(Command::new(0x13, &[1, 1, 0x08, 2]))?;
        engine.do_command(Command::new(0x13, &[1, 2, 0x18, 10]))?;
        engine.do_command(Command::new(0x13, &[2, 1, 0x18, 20]))?;

        assert_eq!(2, engine.do_command(Command::new(0x15, &[1]))?);
        assert_eq!(1, engine.sound_status(2));
        assert_eq!(10, engine.master_volume());
        assert_eq!(1, engine.do_command(Command::new(0x14, &[-1, -1]))?);
        Ok(())
    }

    #[test]
    fn start_trigger_stops_target_first() -> Result<(), Box<dyn Error>> {
        let device = Device::get("mock");
        let mut engine = engine(&device, vec![sound(1, 100, &[0])?, sound(2, 100, &[1])?]);
        engine.start_sound(1)?;
        engine.start_sound(2)?;
        engine.set_trigger(1, 1, Command::new(0x08, &[2]));
        assert_eq!(0, engine.sound_status(2));
        assert_eq!(1, engine.sound_status(1));
        Ok(())
    }
}
