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
    thread,
    time::{Duration, Instant},
};

use midly::{
    num::{u14, u15, u24, u28, u4, u7},
    Format, Fps, Header, MetaMessage, MidiMessage, PitchBend, Smf, Timing, TrackEvent,
    TrackEventKind,
};

/// Wait for the given predicate to return true or fail.
#[inline]
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let mut tick = Duration::from_millis(5);
    let timeout = Duration::from_secs(10);
    let max_tick = Duration::from_millis(100);

    loop {
        if start.elapsed() > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }

        thread::sleep(tick);
        tick = std::cmp::min(tick * 2, max_tick);
    }
}

enum Item {
    Midi(u8, MidiMessage),
    Tempo(u32),
    SysEx(Vec<u8>),
    Marker(Vec<u8>),
}

/// Builds Standard MIDI Files in memory. Events are given at absolute ticks and may be added
/// out of order; events on the same tick keep the order they were added in.
pub struct SmfBuilder {
    timing: Timing,
    tracks: Vec<Vec<(u32, Item)>>,
}

impl SmfBuilder {
    pub fn new(ticks_per_beat: u16) -> SmfBuilder {
        SmfBuilder {
            timing: Timing::Metrical(u15::from_int_lossy(ticks_per_beat)),
            tracks: vec![Vec::new()],
        }
    }

    /// A builder for a file with SMPTE timing.
    pub fn timecode() -> SmfBuilder {
        SmfBuilder {
            timing: Timing::Timecode(Fps::Fps24, 4),
            tracks: vec![Vec::new()],
        }
    }

    /// Starts a new track. Subsequent events land on it.
    pub fn track(mut self) -> SmfBuilder {
        self.tracks.push(Vec::new());
        self
    }

    fn push(mut self, tick: u32, item: Item) -> SmfBuilder {
        if let Some(track) = self.tracks.last_mut() {
            track.push((tick, item));
        }
        self
    }

    fn midi(self, tick: u32, channel: u8, message: MidiMessage) -> SmfBuilder {
        self.push(tick, Item::Midi(channel, message))
    }

    pub fn note_on(self, tick: u32, channel: u8, key: u8, vel: u8) -> SmfBuilder {
        self.midi(
            tick,
            channel,
            MidiMessage::NoteOn {
                key: u7::from_int_lossy(key),
                vel: u7::from_int_lossy(vel),
            },
        )
    }

    pub fn note_off(self, tick: u32, channel: u8, key: u8) -> SmfBuilder {
        self.midi(
            tick,
            channel,
            MidiMessage::NoteOff {
                key: u7::from_int_lossy(key),
                vel: u7::from_int_lossy(0),
            },
        )
    }

    /// A note on followed by its note off.
    pub fn note(self, tick: u32, channel: u8, key: u8, vel: u8, length: u32) -> SmfBuilder {
        self.note_on(tick, channel, key, vel)
            .note_off(tick + length, channel, key)
    }

    pub fn controller(self, tick: u32, channel: u8, controller: u8, value: u8) -> SmfBuilder {
        self.midi(
            tick,
            channel,
            MidiMessage::Controller {
                controller: u7::from_int_lossy(controller),
                value: u7::from_int_lossy(value),
            },
        )
    }

    pub fn program(self, tick: u32, channel: u8, program: u8) -> SmfBuilder {
        self.midi(
            tick,
            channel,
            MidiMessage::ProgramChange {
                program: u7::from_int_lossy(program),
            },
        )
    }

    pub fn pitch_bend(self, tick: u32, channel: u8, bend: i16) -> SmfBuilder {
        self.midi(
            tick,
            channel,
            MidiMessage::PitchBend {
                bend: PitchBend(u14::from_int_lossy((i32::from(bend) + 0x2000) as u16)),
            },
        )
    }

    pub fn tempo(self, tick: u32, usec_per_beat: u32) -> SmfBuilder {
        self.push(tick, Item::Tempo(usec_per_beat))
    }

    /// A raw system exclusive. The data excludes the leading 0xF0.
    pub fn sysex(self, tick: u32, data: &[u8]) -> SmfBuilder {
        self.push(tick, Item::SysEx(data.to_vec()))
    }

    /// A marker in the engine's system exclusive form.
    pub fn marker(self, tick: u32, id: u8) -> SmfBuilder {
        self.sysex(tick, &[0x7D, 0x01, id, 0xF7])
    }

    /// A marker in meta event form.
    pub fn marker_text(self, tick: u32, text: &str) -> SmfBuilder {
        self.push(tick, Item::Marker(text.as_bytes().to_vec()))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn part_setup(
        self,
        tick: u32,
        channel: u8,
        enabled: bool,
        percussion: bool,
        priority: i8,
        volume: u8,
        program: Option<u8>,
    ) -> SmfBuilder {
        let flags = u8::from(enabled) | (u8::from(percussion) << 1) | (u8::from(program.is_some()) << 2);
        self.sysex(
            tick,
            &[
                0x7D,
                0x00,
                channel,
                flags,
                (i16::from(priority) + 64).clamp(0, 127) as u8,
                volume,
                64,
                64,
                64,
                program.unwrap_or(0),
                0xF7,
            ],
        )
    }

    pub fn hook(self, tick: u32, class: u8, value: u8, channel: u8, args: [u8; 3]) -> SmfBuilder {
        self.sysex(
            tick,
            &[0x7D, 0x02, class, value, channel, args[0], args[1], args[2], 0xF7],
        )
    }

    /// Writes the file.
    pub fn build(&self) -> Vec<u8> {
        let tracks: Vec<Vec<TrackEvent>> = self
            .tracks
            .iter()
            .map(|track| {
                let mut items: Vec<&(u32, Item)> = track.iter().collect();
                items.sort_by_key(|(tick, _)| *tick);

                let mut last = 0;
                let mut events: Vec<TrackEvent> = items
                    .into_iter()
                    .map(|(tick, item)| {
                        let delta = tick - last;
                        last = *tick;
                        let kind = match item {
                            Item::Midi(channel, message) => TrackEventKind::Midi {
                                channel: u4::from_int_lossy(*channel),
                                message: *message,
                            },
                            Item::Tempo(tempo) => {
                                TrackEventKind::Meta(MetaMessage::Tempo(u24::from_int_lossy(*tempo)))
                            }
                            Item::SysEx(data) => TrackEventKind::SysEx(data),
                            Item::Marker(text) => TrackEventKind::Meta(MetaMessage::Marker(text)),
                        };
                        TrackEvent {
                            delta: u28::from_int_lossy(delta),
                            kind,
                        }
                    })
                    .collect();
                events.push(TrackEvent {
                    delta: u28::from_int_lossy(0),
                    kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
                });
                events
            })
            .collect();

        let format = if tracks.len() > 1 {
            Format::Parallel
        } else {
            Format::SingleTrack
        };
        let smf = Smf {
            header: Header::new(format, self.timing),
            tracks,
        };
        let mut buf = Vec::new();
        smf.write_std(&mut buf).expect("unable to write test MIDI file");
        buf
    }
}
