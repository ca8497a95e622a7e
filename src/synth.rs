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

//! The synthesizer device boundary.
//!
//! The engine never renders audio itself. It binds its logical parts to the
//! scarce channels a device hands out and drives the device one channel
//! message at a time. The device in turn owns the clock: it calls the
//! registered timer callback once per base tempo period.

use std::{error::Error, fmt, sync::Arc, time::Duration};

use midly::{
    num::{u14, u7},
    MidiMessage, PitchBend,
};

mod midir;
mod mock;
mod timer;

#[cfg(test)]
pub(crate) use mock::Device as MockDevice;

/// Channel number 9 (zero based) is reserved for percussion on General MIDI devices.
pub const GM_PERCUSSION_CHANNEL: u8 = 9;

/// A hardware channel on a synthesizer device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Returns the raw channel number.
    pub fn as_int(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The periodic callback a device fires once per base tempo period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A synthesizer device that hands out channels and renders notes.
pub trait Device: fmt::Display + Send + Sync {
    /// Returns the name of the device.
    fn name(&self) -> String;

    /// Opens the device for output.
    fn open(&self) -> Result<(), Box<dyn Error>>;

    /// Closes the device. Any registered timer callback stops firing.
    fn close(&self);

    /// Allocates a free melodic channel, if one is available.
    fn allocate_channel(&self) -> Option<ChannelId>;

    /// Returns a channel to the device.
    fn release_channel(&self, channel: ChannelId);

    /// The dedicated percussion channel, if the device has one. It is never
    /// handed out by allocate_channel.
    fn percussion_channel(&self) -> Option<ChannelId>;

    /// Sends a channel message.
    fn send(&self, channel: ChannelId, message: MidiMessage);

    /// The timer period in microseconds.
    fn base_tempo(&self) -> u32;

    /// Registers (or with None, removes) the periodic timer callback.
    fn set_timer_callback(&self, callback: Option<TimerCallback>);

    /// Sets the channel priority. Only devices that arbitrate voices
    /// internally care about this.
    fn priority(&self, _channel: ChannelId, _priority: u8) {}

    fn note_on(&self, channel: ChannelId, note: u8, velocity: u8) {
        self.send(
            channel,
            MidiMessage::NoteOn {
                key: u7::from_int_lossy(note),
                vel: u7::from_int_lossy(velocity),
            },
        );
    }

    fn note_off(&self, channel: ChannelId, note: u8) {
        self.send(
            channel,
            MidiMessage::NoteOff {
                key: u7::from_int_lossy(note),
                vel: u7::from_int_lossy(0),
            },
        );
    }

    fn controller(&self, channel: ChannelId, controller: u8, value: u8) {
        self.send(
            channel,
            MidiMessage::Controller {
                controller: u7::from_int_lossy(controller),
                value: u7::from_int_lossy(value),
            },
        );
    }

    /// Sends a signed pitch bend in -8192..=8191.
    fn pitch_bend(&self, channel: ChannelId, bend: i16) {
        let raw = (i32::from(bend).clamp(-8192, 8191) + 0x2000) as u16;
        self.send(
            channel,
            MidiMessage::PitchBend {
                bend: PitchBend(u14::from_int_lossy(raw)),
            },
        );
    }

    /// Sets the pitch bend range in semitones through RPN 0.
    fn pitch_bend_factor(&self, channel: ChannelId, semitones: u8) {
        self.controller(channel, 101, 0);
        self.controller(channel, 100, 0);
        self.controller(channel, 6, semitones);
        self.controller(channel, 38, 0);
        self.controller(channel, 101, 127);
        self.controller(channel, 100, 127);
    }

    fn modulation(&self, channel: ChannelId, value: u8) {
        self.controller(channel, 1, value);
    }

    fn volume(&self, channel: ChannelId, value: u8) {
        self.controller(channel, 7, value);
    }

    /// Sends a pan position in 0..=127 where 64 is center.
    fn pan(&self, channel: ChannelId, value: u8) {
        self.controller(channel, 10, value);
    }

    fn sustain(&self, channel: ChannelId, on: bool) {
        self.controller(channel, 64, if on { 127 } else { 0 });
    }

    fn effect_level(&self, channel: ChannelId, value: u8) {
        self.controller(channel, 91, value);
    }

    fn chorus_level(&self, channel: ChannelId, value: u8) {
        self.controller(channel, 93, value);
    }

    fn program_change(&self, channel: ChannelId, program: u8) {
        self.send(
            channel,
            MidiMessage::ProgramChange {
                program: u7::from_int_lossy(program),
            },
        );
    }

    fn all_notes_off(&self, channel: ChannelId) {
        self.controller(channel, 123, 0);
    }
}

/// Lists the MIDI output devices known to midir.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, Box<dyn Error>> {
    midir::list()
}

/// Gets a device with the given name. Names starting with "mock" produce an
/// in-memory device that ticks on its own timer thread.
pub fn get_device(name: &str, timer_period: Duration) -> Result<Arc<dyn Device>, Box<dyn Error>> {
    if name.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(name).ticking(timer_period)));
    };

    Ok(Arc::new(midir::get(name, timer_period)?))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use midly::MidiMessage;

    use super::{ChannelId, Device, MockDevice};

    #[test]
    fn pitch_bend_is_centered_and_clamped() {
        let device = Arc::new(MockDevice::get("mock"));
        device.pitch_bend(ChannelId(0), 0);
        device.pitch_bend(ChannelId(0), i16::MIN);
        device.pitch_bend(ChannelId(0), i16::MAX);

        let bends: Vec<u16> = device
            .messages()
            .into_iter()
            .filter_map(|(_, message)| match message {
                MidiMessage::PitchBend { bend } => Some(bend.0.as_int()),
                _ => None,
            })
            .collect();
        assert_eq!(vec![0x2000, 0, 0x3FFF], bends);
    }

    #[test]
    fn pitch_bend_factor_uses_rpn_zero() {
        let device = MockDevice::get("mock");
        device.pitch_bend_factor(ChannelId(3), 12);

        let controllers: Vec<(u8, u8)> = device
            .messages()
            .into_iter()
            .filter_map(|(channel, message)| match message {
                MidiMessage::Controller { controller, value } if channel == ChannelId(3) => {
                    Some((controller.as_int(), value.as_int()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            vec![(101, 0), (100, 0), (6, 12), (38, 0), (101, 127), (100, 127)],
            controllers
        );
    }
}
