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
use midly::{num::u7, MidiMessage};
use tracing::{debug, warn};

use crate::sound::{HookEvent, PartSetup, SoundEvent, TimedEvent};

use super::{
    hook::HookClass,
    player::{position, Loop},
    CommandError, Engine, PlayerId,
};

/// Default tempo, 120 beats per minute.
pub const DEFAULT_TEMPO: u32 = 500_000;

/// A player's position in its sound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequencer {
    /// Index of the next event to dispatch.
    pub cursor: usize,
    /// Current position in ticks.
    pub tick: u32,
    /// Microseconds per beat.
    pub tempo: u32,
    /// Elapsed time not yet worth a whole tick, in microsecond-ticks per beat.
    pub accum: u64,
}

impl Default for Sequencer {
    fn default() -> Self {
        Sequencer {
            cursor: 0,
            tick: 0,
            tempo: DEFAULT_TEMPO,
            accum: 0,
        }
    }
}

impl Sequencer {
    /// Converts elapsed microseconds into whole ticks, carrying the remainder to the next call.
    pub fn advance(&mut self, usec: u64, ticks_per_beat: u16) -> u32 {
        let tempo = u64::from(self.tempo.max(1));
        self.accum += usec * u64::from(ticks_per_beat);
        let ticks = self.accum / tempo;
        self.accum %= tempo;
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }

    /// Returns the next event if it falls before the bound and moves past it.
    pub fn next_due(&mut self, events: &[TimedEvent], bound: u32) -> Option<TimedEvent> {
        let event = *events.get(self.cursor)?;
        if event.tick >= bound {
            return None;
        }
        self.cursor += 1;
        self.tick = self.tick.max(event.tick);
        Some(event)
    }

    /// Moves to a tick whose events have already been dispatched. At tick zero nothing has
    /// played yet.
    pub fn resume(&mut self, events: &[TimedEvent], tick: u32) {
        self.cursor = if tick == 0 {
            0
        } else {
            events.partition_point(|event| event.tick <= tick)
        };
        self.tick = tick;
        self.accum = 0;
    }

    /// Moves to an absolute tick.
    pub fn seek(&mut self, events: &[TimedEvent], tick: u32) {
        self.cursor = events.partition_point(|event| event.tick < tick);
        self.tick = tick;
        self.accum = 0;
    }
}

impl Engine {
    /// Plays a player forward by the given number of microseconds.
    pub(super) fn play(&mut self, pid: PlayerId, usec: u64) {
        let Some(sound) = self.players[pid].sound.clone() else {
            return;
        };
        let ticks_per_beat = sound.ticks_per_beat();
        let generation = self.players[pid].generation;
        let elapsed = self.players[pid].sequencer.advance(usec, ticks_per_beat);
        let end = self.players[pid].sequencer.tick.saturating_add(elapsed);

        loop {
            let player = &mut self.players[pid];
            if !player.active || player.generation != generation {
                return;
            }
            let loop_point = player
                .looping
                .map(|looping| looping.from_position(ticks_per_beat))
                .filter(|from| *from <= end && *from >= player.sequencer.tick);
            let bound = loop_point.unwrap_or(end.saturating_add(1));

            match player.sequencer.next_due(sound.events(), bound) {
                Some(event) => self.dispatch(pid, event.event),
                None => {
                    if loop_point.is_some() {
                        self.loop_back(pid);
                    } else {
                        self.players[pid].sequencer.tick = end;
                    }
                    return;
                }
            }
        }
    }

    /// Takes the pending loop back to its start.
    fn loop_back(&mut self, pid: PlayerId) {
        let player = &mut self.players[pid];
        let Some(mut looping) = player.looping else {
            return;
        };
        let to = looping.to_position(player.ticks_per_beat());
        looping.count = looping.count.saturating_sub(1);
        player.looping = (looping.count > 0).then_some(looping);
        debug!(sound = player.id, to, remaining = looping.count, "Looping.");
        self.seek_player(pid, to);
    }

    /// Silences a player's notes and moves it to an absolute tick.
    fn seek_player(&mut self, pid: PlayerId, tick: u32) {
        self.silence_player(pid);
        let player = &mut self.players[pid];
        if let Some(sound) = player.sound.clone() {
            player.sequencer.seek(sound.events(), tick);
        }
        player.generation = player.generation.wrapping_add(1);
    }

    fn silence_player(&mut self, pid: PlayerId) {
        let parts = self.players[pid].parts;
        for part_id in parts.into_iter().flatten() {
            self.parts[part_id].silence(self.device.as_ref());
        }
    }

    /// Converts a script position into a tick, checking it lies within the sound.
    fn script_position(
        &self,
        pid: PlayerId,
        track: i32,
        beat: i32,
        tick: i32,
    ) -> Result<u32, CommandError> {
        if track != 0 {
            return Err(CommandError::InvalidArgument("track"));
        }
        let beat = u16::try_from(beat)
            .ok()
            .filter(|beat| *beat >= 1)
            .ok_or(CommandError::InvalidArgument("beat"))?;
        let tick = u16::try_from(tick).map_err(|_| CommandError::InvalidArgument("tick"))?;

        let player = &self.players[pid];
        let target = position(beat, tick, player.ticks_per_beat());
        let length = player.sound.as_ref().map(|sound| sound.length()).unwrap_or(0);
        if target > length {
            return Err(CommandError::InvalidArgument("position"));
        }
        Ok(target)
    }

    /// Jumps to a position. Beats are one based.
    pub fn jump(&mut self, pid: PlayerId, track: i32, beat: i32, tick: i32) -> Result<(), CommandError> {
        let target = self.script_position(pid, track, beat, tick)?;
        debug!(sound = self.players[pid].id, target, "Jumping.");
        self.seek_player(pid, target);
        Ok(())
    }

    /// Jumps to a position, replaying everything but notes on the way so the channel state
    /// matches, then sounds the notes that would be held there.
    pub fn scan(&mut self, pid: PlayerId, track: i32, beat: i32, tick: i32) -> Result<(), CommandError> {
        let target = self.script_position(pid, track, beat, tick)?;
        let Some(sound) = self.players[pid].sound.clone() else {
            return Err(CommandError::NoSuchSound(i32::from(self.players[pid].id)));
        };
        debug!(sound = sound.id(), target, "Scanning.");

        self.silence_player(pid);
        self.players[pid].sequencer.tempo = DEFAULT_TEMPO;

        let mut held: Vec<(u8, u8, u8)> = Vec::new();
        for event in sound.events().iter().take_while(|event| event.tick < target) {
            match event.event {
                SoundEvent::Midi {
                    channel,
                    message: MidiMessage::NoteOn { key, vel },
                } if vel.as_int() > 0 => {
                    held.retain(|(c, k, _)| (*c, *k) != (channel, key.as_int()));
                    held.push((channel, key.as_int(), vel.as_int()));
                }
                SoundEvent::Midi {
                    channel,
                    message: MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. },
                } => held.retain(|(c, k, _)| (*c, *k) != (channel, key.as_int())),
                SoundEvent::Midi { channel, message } => self.dispatch_midi(pid, channel, message),
                SoundEvent::Tempo(tempo) => self.players[pid].sequencer.tempo = tempo.max(1),
                SoundEvent::PartSetup(setup) => self.apply_part_setup(pid, &setup),
                SoundEvent::Marker(_) | SoundEvent::Hook(_) | SoundEvent::End => {}
            }
        }

        let player = &mut self.players[pid];
        player.sequencer.seek(sound.events(), target);
        player.generation = player.generation.wrapping_add(1);

        for (channel, key, vel) in held {
            self.dispatch_midi(
                pid,
                channel,
                MidiMessage::NoteOn {
                    key: u7::from_int_lossy(key),
                    vel: u7::from_int_lossy(vel),
                },
            );
        }
        Ok(())
    }

    /// Sets a loop. Fails unless the loop end lies at least two beats after its start.
    pub fn set_loop(
        &mut self,
        pid: PlayerId,
        count: i32,
        to_beat: i32,
        to_tick: i32,
        from_beat: i32,
        from_tick: i32,
    ) -> Result<(), CommandError> {
        if to_beat + 1 >= from_beat {
            return Err(CommandError::InvalidArgument("loop points"));
        }
        let field = |value: i32, name: &'static str| {
            u16::try_from(value).map_err(|_| CommandError::InvalidArgument(name))
        };
        let looping = Loop {
            count: field(count, "loop count")?,
            to_beat: field(to_beat, "loop beat")?.max(1),
            to_tick: field(to_tick, "loop tick")?,
            from_beat: field(from_beat, "loop beat")?,
            from_tick: field(from_tick, "loop tick")?,
        };
        self.players[pid].looping = (looping.count > 0).then_some(looping);
        Ok(())
    }

    pub fn clear_loop(&mut self, pid: PlayerId) {
        self.players[pid].looping = None;
    }

    fn dispatch(&mut self, pid: PlayerId, event: SoundEvent) {
        match event {
            SoundEvent::Midi { channel, message } => self.dispatch_midi(pid, channel, message),
            SoundEvent::Tempo(tempo) => self.players[pid].sequencer.tempo = tempo.max(1),
            SoundEvent::Marker(marker) => {
                let sound = self.players[pid].id;
                self.handle_marker(sound, marker);
            }
            SoundEvent::PartSetup(setup) => self.apply_part_setup(pid, &setup),
            SoundEvent::Hook(hook) => self.dispatch_hook(pid, hook),
            SoundEvent::End => {
                if self.players[pid].looping.is_some() {
                    self.loop_back(pid);
                } else {
                    debug!(sound = self.players[pid].id, "End of sound.");
                    self.clear_player(pid);
                }
            }
        }
    }

    fn dispatch_midi(&mut self, pid: PlayerId, channel: u8, message: MidiMessage) {
        let Some(part_id) = self.player_part(pid, channel) else {
            return;
        };
        match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                let velocity = self.velocity(pid, vel.as_int());
                self.parts[part_id].note_on(self.device.as_ref(), key.as_int(), velocity);
            }
            MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                self.parts[part_id].note_off(self.device.as_ref(), key.as_int());
            }
            MidiMessage::Controller { controller, value } => {
                self.part_controller(part_id, controller.as_int(), value.as_int())
            }
            MidiMessage::ProgramChange { program } => {
                self.parts[part_id].set_program(self.device.as_ref(), program.as_int())
            }
            MidiMessage::PitchBend { bend } => {
                self.parts[part_id].set_pitch_bend(self.device.as_ref(), bend.as_int())
            }
            MidiMessage::Aftertouch { .. } | MidiMessage::ChannelAftertouch { .. } => {}
        }
    }

    /// MT-32 sounds are authored for its velocity curve. Other devices get a flatter one.
    fn velocity(&self, pid: PlayerId, velocity: u8) -> u8 {
        let mt32 = self.players[pid]
            .sound
            .as_ref()
            .is_some_and(|sound| sound.mt32());
        if mt32 && !self.properties.native_mt32 {
            (u16::from(velocity) * 3 / 4 + 32).min(127) as u8
        } else {
            velocity
        }
    }

    fn part_controller(&mut self, part_id: usize, controller: u8, value: u8) {
        let device = self.device.clone();
        let device = device.as_ref();
        let centered = (i16::from(value) - 64) as i8;
        match controller {
            1 => self.parts[part_id].set_modulation(device, value),
            7 => {
                self.parts[part_id].volume = value;
                self.refresh_part(part_id);
            }
            10 => {
                self.parts[part_id].pan = centered.max(-64);
                self.refresh_part(part_id);
            }
            16 => self.parts[part_id].set_pitch_bend_factor(device, value),
            17 => {
                self.parts[part_id].detune = centered;
                self.refresh_part(part_id);
            }
            18 => {
                self.parts[part_id].priority = centered;
                self.refresh_part(part_id);
                self.reallocate_channels();
            }
            64 => self.parts[part_id].set_sustain(device, value >= 64),
            91 => self.parts[part_id].set_effect_level(device, value),
            93 => self.parts[part_id].set_chorus(device, value),
            123 => self.parts[part_id].silence(device),
            _ => self.parts[part_id].controller(device, controller, value),
        }
    }

    fn apply_part_setup(&mut self, pid: PlayerId, setup: &PartSetup) {
        let Some(part_id) = self.player_part(pid, setup.channel) else {
            return;
        };
        let part = &mut self.parts[part_id];
        part.apply_setup(setup);
        if !part.wants_channel() {
            part.unbind(self.device.as_ref());
        }
        self.refresh_part(part_id);
        self.parts[part_id].send_all(self.device.as_ref());
        self.reallocate_channels();
    }

    fn dispatch_hook(&mut self, pid: PlayerId, hook: HookEvent) {
        let Ok(class) = HookClass::try_from(i32::from(hook.class)) else {
            warn!(class = hook.class, "Unknown hook class.");
            return;
        };
        if !self.players[pid].hooks.consume(class, hook.value, hook.channel) {
            return;
        }
        debug!(sound = self.players[pid].id, ?class, value = hook.value, "Hook fired.");

        let [a0, a1, a2] = hook.args;
        let channel = hook.channel;
        match class {
            HookClass::Jump => {
                let tick = (i32::from(a1) << 7) | i32::from(a2);
                if let Err(e) = self.jump(pid, 0, i32::from(a0), tick) {
                    warn!(err = e.to_string(), "Hook jump failed.");
                }
            }
            HookClass::Transpose => self.set_player_transpose(pid, a0 != 0, i32::from(a1) - 64),
            HookClass::PartOnOff => self.set_part_enabled(pid, channel, a0 != 0),
            HookClass::PartVolume => self.set_part_volume(pid, channel, a0),
            HookClass::PartProgram => self.set_part_program(pid, channel, a0),
            HookClass::PartTranspose => {
                self.set_part_transpose(pid, channel, a0 != 0, i32::from(a1) - 64)
            }
        }
    }
}
