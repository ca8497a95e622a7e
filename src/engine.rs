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

//! The engine core. Nothing in here locks: the facade owns the engine behind
//! one mutex and every entry point, the timer included, goes through it.
//!
//! Players and parts live in fixed pools and refer to each other by index.
//! A part's owning player is a plain back reference; the player's part table
//! is the owning side.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    sound::{SoundId, SoundLibrary},
    synth::Device,
};

mod allocator;
pub mod command;
mod deferred;
mod fader;
mod hook;
mod part;
mod player;
mod queue;
pub mod save;
mod sequencer;
mod triggers;
mod volume;

pub use command::{Command, CommandError, Properties, Property};
pub use fader::FadeKind;
pub use hook::HookClass;
pub use part::Part;
pub use player::Player;
pub use volume::VOLUME_GROUPS;

use deferred::DeferredCommands;
use player::DEFAULT_SPEED;
use queue::CommandQueue;
use triggers::TriggerTable;
use volume::Volume;

/// Size of the player pool.
pub const MAX_PLAYERS: usize = 8;
/// Size of the part pool.
pub const MAX_PARTS: usize = 32;

pub type PlayerId = usize;
pub type PartId = usize;

pub struct Engine {
    device: Arc<dyn Device>,
    library: Arc<dyn SoundLibrary>,
    properties: Properties,
    players: Vec<Player>,
    parts: Vec<Part>,
    volume: Volume,
    queue: CommandQueue,
    deferred: DeferredCommands,
    triggers: TriggerTable,
}

impl Engine {
    pub fn new(
        device: Arc<dyn Device>,
        library: Arc<dyn SoundLibrary>,
        properties: Properties,
    ) -> Engine {
        Engine {
            device,
            library,
            properties,
            players: vec![Player::default(); MAX_PLAYERS],
            parts: vec![Part::default(); MAX_PARTS],
            volume: Volume::default(),
            queue: CommandQueue::default(),
            deferred: DeferredCommands::default(),
            triggers: TriggerTable::default(),
        }
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, property: Property) -> u32 {
        self.properties.get(property)
    }

    /// Sets a property, returning the previous value.
    pub fn set_property(&mut self, property: Property, value: u32) -> u32 {
        let old = self.properties.set(property, value);
        debug!(?property, old, new = self.properties.get(property), "Set property.");
        old
    }

    pub fn master_volume(&self) -> u8 {
        self.volume.master
    }

    pub fn music_volume(&self) -> u8 {
        self.volume.music
    }

    /// Returns the active player that owns the sound.
    pub fn find_player(&self, sound: SoundId) -> Option<PlayerId> {
        self.players.iter().position(|player| player.owns(sound))
    }

    /// Looks up the active player for a sound id given by a script.
    fn active_player(&self, sound: i32) -> Result<PlayerId, CommandError> {
        SoundId::try_from(sound)
            .ok()
            .and_then(|sound| self.find_player(sound))
            .ok_or(CommandError::NoSuchSound(sound))
    }

    /// Starts a sound. A sound that is already playing restarts in place.
    pub fn start_sound(&mut self, id: SoundId) -> Result<(), CommandError> {
        let sound = self
            .library
            .sound(id)
            .ok_or(CommandError::UnknownSound(i32::from(id)))?;

        let pid = match self.find_player(id) {
            Some(pid) => {
                debug!(sound = id, player = pid, "Restarting sound in place.");
                self.release_parts(pid);
                pid
            }
            None => self
                .allocate_player(sound.priority())
                .ok_or(CommandError::Denied(i32::from(id)))?,
        };

        self.players[pid].start(sound);
        info!(
            sound = id,
            player = pid,
            priority = self.players[pid].priority,
            "Starting sound."
        );
        self.reallocate_channels();
        Ok(())
    }

    /// Stops a sound. Stopping a sound that isn't playing does nothing.
    pub fn stop_sound(&mut self, id: SoundId) {
        if let Some(pid) = self.find_player(id) {
            self.clear_player(pid);
        }
    }

    pub fn stop_all_sounds(&mut self) {
        for pid in 0..MAX_PLAYERS {
            self.clear_player(pid);
        }
    }

    /// 1 if the sound is playing, 0 otherwise. -1 asks whether anything is playing.
    pub fn sound_status(&self, sound: i32) -> i32 {
        let playing = if sound == -1 {
            self.players.iter().any(|player| player.active)
        } else {
            SoundId::try_from(sound)
                .ok()
                .and_then(|sound| self.find_player(sound))
                .is_some()
        };
        i32::from(playing)
    }

    /// Returns true if the sound is fading out to silence.
    pub fn is_fading_out(&self, sound: SoundId) -> bool {
        self.find_player(sound)
            .is_some_and(|pid| self.players[pid].faders.fading_out())
    }

    /// Returns every part a player owns to the pool.
    fn release_parts(&mut self, pid: PlayerId) {
        let parts = std::mem::take(&mut self.players[pid].parts);
        for part_id in parts.into_iter().flatten() {
            self.parts[part_id].uninit(self.device.as_ref());
        }
    }

    /// Stops a player: silences and frees its parts, marks it inactive and then fires the
    /// trigger table entries its sound owns.
    pub(crate) fn clear_player(&mut self, pid: PlayerId) {
        if !self.players[pid].active {
            return;
        }
        let sound = self.players[pid].id;
        self.release_parts(pid);
        self.players[pid].reset();
        info!(sound, player = pid, "Stopped sound.");

        for command in self.triggers.take_owned(sound) {
            debug!(sound, opcode = command.opcode, "Firing trigger of stopped sound.");
            self.execute(command);
        }
        self.reallocate_channels();
    }

    /// Runs a command from the queue, a trigger or the deferred table. Failures have no caller
    /// to report to, so they are only logged.
    fn execute(&mut self, command: Command) {
        if let Err(e) = self.do_command(command) {
            debug!(
                err = e.to_string(),
                opcode = command.opcode,
                "Queued command failed."
            );
        }
    }

    /// Handles a marker emitted by a sound: drains the matching queued trigger, then fires the
    /// matching trigger table entry.
    fn handle_marker(&mut self, sound: SoundId, marker: u8) {
        if self.queue.begin_marker(sound, marker) {
            debug!(sound, marker, "Marker matched queued trigger.");
            while let Some(command) = self.queue.next_command() {
                self.execute(command);
                if self.queue.was_cleared() {
                    break;
                }
            }
        }
        if let Some(command) = self.triggers.take_matching(sound, marker) {
            debug!(sound, marker, opcode = command.opcode, "Marker fired trigger.");
            self.execute(command);
        }
    }

    /// The periodic tick. Runs due deferred commands, steps faders and advances every player.
    pub fn on_timer(&mut self) {
        for command in self.deferred.advance(1) {
            self.execute(command);
        }

        let base_tempo = u64::from(self.device.base_tempo());
        for pid in 0..MAX_PLAYERS {
            if !self.players[pid].active {
                continue;
            }
            self.step_faders(pid);
            if !self.players[pid].active {
                continue;
            }
            let usec = base_tempo
                * u64::from(self.properties.tempo_base)
                * u64::from(self.players[pid].speed)
                / (100 * u64::from(DEFAULT_SPEED));
            self.play(pid, usec);
        }
    }

    /// Schedules a command to run after the given number of hundredths of a second.
    pub fn schedule(&mut self, hundredths: u32, command: Command) {
        let base_tempo = self.device.base_tempo();
        if !self.deferred.schedule(hundredths, base_tempo, command) {
            warn!(opcode = command.opcode, "Deferred command table full, dropping command.");
        }
    }

    fn step_faders(&mut self, pid: PlayerId) {
        for step in self.players[pid].faders.advance(1) {
            self.apply_fade(pid, step.kind, step.value);
            if step.kind == FadeKind::Volume && step.done && step.value == 0 {
                debug!(sound = self.players[pid].id, "Faded out.");
                self.clear_player(pid);
                return;
            }
        }
    }

    fn apply_fade(&mut self, pid: PlayerId, kind: FadeKind, value: i32) {
        match kind {
            FadeKind::Volume => {
                self.players[pid].volume = value.clamp(0, 127) as u8;
                self.refresh_player(pid);
            }
            FadeKind::Transpose => {
                self.players[pid].set_transpose(false, value);
                self.refresh_player(pid);
            }
            FadeKind::Speed => self.players[pid].speed = value.clamp(0, 255) as u8,
        }
    }

    /// Starts a fade of a player parameter. A zero length fade applies immediately.
    pub fn add_fade(
        &mut self,
        pid: PlayerId,
        kind: FadeKind,
        target: i32,
        ticks: u32,
    ) -> Result<(), CommandError> {
        if ticks == 0 {
            self.players[pid].faders.remove(kind);
            self.apply_fade(pid, kind, target);
            return Ok(());
        }
        let player = &self.players[pid];
        let start = match kind {
            FadeKind::Volume => i32::from(player.volume),
            FadeKind::Transpose => i32::from(player.transpose),
            FadeKind::Speed => i32::from(player.speed),
        };
        self.players[pid].faders.add(kind, start, target, ticks)
    }

    /// Recomputes a part's effective values and sends them if it's bound.
    fn refresh_part(&mut self, part_id: PartId) {
        let Some(pid) = self.parts[part_id].player else {
            return;
        };
        let context = self.players[pid].context();
        self.parts[part_id].recompute(&context, &self.volume);
        self.parts[part_id].send_effective(self.device.as_ref());
    }

    fn refresh_player(&mut self, pid: PlayerId) {
        let parts = self.players[pid].parts;
        for part_id in parts.into_iter().flatten() {
            self.refresh_part(part_id);
        }
    }

    fn refresh_all(&mut self) {
        for part_id in 0..MAX_PARTS {
            self.refresh_part(part_id);
        }
    }

    pub fn set_master_volume(&mut self, volume: u8) {
        self.volume.master = volume;
        self.refresh_all();
    }

    pub fn set_music_volume(&mut self, volume: u8) {
        self.volume.music = volume;
        self.refresh_all();
    }

    /// Sets the level of a shared volume group.
    pub fn set_group_volume(&mut self, group: i32, level: i32) -> Result<(), CommandError> {
        let group = usize::try_from(group)
            .ok()
            .filter(|group| *group < VOLUME_GROUPS)
            .ok_or(CommandError::InvalidArgument("volume group"))?;
        self.volume.groups[group] = u8::try_from(level)
            .ok()
            .filter(|level| *level <= 127)
            .ok_or(CommandError::InvalidArgument("volume group level"))?;
        self.refresh_all();
        Ok(())
    }

    pub fn set_player_group(&mut self, pid: PlayerId, group: i32) -> Result<(), CommandError> {
        self.players[pid].group = u8::try_from(group)
            .ok()
            .filter(|group| usize::from(*group) < VOLUME_GROUPS)
            .ok_or(CommandError::InvalidArgument("volume group"))?;
        self.refresh_player(pid);
        Ok(())
    }

    pub fn set_player_priority(&mut self, pid: PlayerId, priority: i32) -> Result<(), CommandError> {
        self.players[pid].priority =
            u8::try_from(priority).map_err(|_| CommandError::InvalidArgument("priority"))?;
        self.refresh_player(pid);
        self.reallocate_channels();
        Ok(())
    }

    pub fn set_player_volume(&mut self, pid: PlayerId, volume: i32) -> Result<(), CommandError> {
        self.players[pid].volume = u8::try_from(volume)
            .ok()
            .filter(|volume| *volume <= 127)
            .ok_or(CommandError::InvalidArgument("volume"))?;
        self.refresh_player(pid);
        Ok(())
    }

    pub fn set_player_pan(&mut self, pid: PlayerId, pan: i32) -> Result<(), CommandError> {
        if !(-64..=63).contains(&pan) {
            return Err(CommandError::InvalidArgument("pan"));
        }
        self.players[pid].pan = pan as i8;
        self.refresh_player(pid);
        Ok(())
    }

    pub fn set_player_transpose(&mut self, pid: PlayerId, relative: bool, transpose: i32) {
        self.players[pid].set_transpose(relative, transpose);
        self.refresh_player(pid);
    }

    pub fn set_player_detune(&mut self, pid: PlayerId, detune: i32) {
        self.players[pid].detune = detune.clamp(-128, 127) as i8;
        self.refresh_player(pid);
    }

    pub fn set_player_speed(&mut self, pid: PlayerId, speed: i32) -> Result<(), CommandError> {
        self.players[pid].speed =
            u8::try_from(speed).map_err(|_| CommandError::InvalidArgument("speed"))?;
        Ok(())
    }

    /// Turns one of a player's parts on or off.
    pub fn set_part_enabled(&mut self, pid: PlayerId, channel: u8, enabled: bool) {
        let Some(part_id) = self.player_part(pid, channel) else {
            return;
        };
        self.parts[part_id].enabled = enabled;
        if !enabled {
            self.parts[part_id].unbind(self.device.as_ref());
        }
        self.reallocate_channels();
    }

    pub fn set_part_volume(&mut self, pid: PlayerId, channel: u8, volume: u8) {
        let Some(part_id) = self.player_part(pid, channel) else {
            return;
        };
        self.parts[part_id].volume = volume.min(127);
        self.refresh_part(part_id);
    }

    pub fn set_part_program(&mut self, pid: PlayerId, channel: u8, program: u8) {
        if let Some(part_id) = self.player_part(pid, channel) {
            self.parts[part_id].set_program(self.device.as_ref(), program);
        }
    }

    pub fn set_part_transpose(&mut self, pid: PlayerId, channel: u8, relative: bool, transpose: i32) {
        let Some(part_id) = self.player_part(pid, channel) else {
            return;
        };
        let part = &mut self.parts[part_id];
        let transpose = if relative {
            i32::from(part.transpose) + transpose
        } else {
            transpose
        };
        part.transpose = transpose.clamp(-24, 24) as i8;
        self.refresh_part(part_id);
    }

    /// Reads a player parameter for scripts.
    pub fn get_param(&self, pid: PlayerId, param: i32, channel: i32) -> i32 {
        let player = &self.players[pid];
        let looping = player.looping.unwrap_or_default();
        let part = usize::try_from(channel)
            .ok()
            .and_then(|channel| player.parts.get(channel).copied().flatten())
            .map(|part_id| &self.parts[part_id]);

        match param {
            0 => i32::from(player.priority),
            1 => i32::from(player.volume),
            2 => i32::from(player.pan),
            3 => i32::from(player.transpose),
            4 => i32::from(player.detune),
            5 => i32::from(player.speed),
            6 => 0,
            7 => player.beat_and_tick().0 as i32,
            8 => player.beat_and_tick().1 as i32,
            9 => i32::from(looping.count),
            10 => i32::from(looping.to_beat),
            11 => i32::from(looping.to_tick),
            12 => i32::from(looping.from_beat),
            13 => i32::from(looping.from_tick),
            14..=17 => match part {
                None => 129,
                Some(part) => match param {
                    14 => i32::from(part.enabled),
                    15 => i32::from(part.volume),
                    16 => part.program.map(i32::from).unwrap_or(128),
                    _ => i32::from(part.transpose),
                },
            },
            18..=23 => player.hooks.query(param, channel),
            _ => -1,
        }
    }

    /// Stops everything before the engine goes away.
    pub fn terminate(&mut self) {
        self.triggers = TriggerTable::default();
        self.queue.clear();
        self.deferred.clear();
        self.stop_all_sounds();
        info!("Engine terminated.");
    }

    /// Checks the pool bookkeeping, returning a description of the first problem found.
    #[cfg(test)]
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut channels = std::collections::HashSet::new();
        for (part_id, part) in self.parts.iter().enumerate() {
            if let Some(hw) = part.hw {
                if !channels.insert(hw) {
                    return Err(format!("channel {} bound to two parts", hw));
                }
                if part.percussion {
                    return Err(format!("percussion part {} holds channel {}", part_id, hw));
                }
            }
            match part.player {
                Some(pid) => {
                    let player = self
                        .players
                        .get(pid)
                        .ok_or(format!("part {} owned by missing player {}", part_id, pid))?;
                    if !player.active {
                        return Err(format!("part {} owned by inactive player {}", part_id, pid));
                    }
                    if player.parts[usize::from(part.channel)] != Some(part_id) {
                        return Err(format!("player {} doesn't list part {}", pid, part_id));
                    }
                }
                None if part.hw.is_some() => {
                    return Err(format!("free part {} holds a channel", part_id))
                }
                None => {}
            }
        }

        let mut sounds = std::collections::HashSet::new();
        for (pid, player) in self.players.iter().enumerate() {
            if !player.active {
                if player.part_ids().next().is_some() {
                    return Err(format!("inactive player {} owns parts", pid));
                }
                continue;
            }
            if !sounds.insert(player.id) {
                return Err(format!("sound {} has two players", player.id));
            }
            for part_id in player.part_ids() {
                if self.parts.get(part_id).and_then(|part| part.player) != Some(pid) {
                    return Err(format!("player {} lists foreign part {}", pid, part_id));
                }
            }
        }
        Ok(())
    }
}
