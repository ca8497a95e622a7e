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
use std::{error::Error, fmt, sync::Arc, time::Duration};

use midly::MidiMessage;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{timer::Timer, ChannelId, TimerCallback, GM_PERCUSSION_CHANNEL};

/// Default mock timer period, 100 ticks per second.
const DEFAULT_BASE_TEMPO: u32 = 10_000;

struct State {
    open: bool,
    /// Melodic channels in allocation order, with their allocated flag.
    channels: Vec<(ChannelId, bool)>,
    percussion: Option<ChannelId>,
    messages: Vec<(ChannelId, MidiMessage)>,
    timer: Option<Timer>,
}

/// A mock device. Doesn't actually render anything, it records every message it is sent.
#[derive(Clone)]
pub struct Device {
    name: String,
    base_tempo: u32,
    /// When set, registering a callback starts a timer thread with this period.
    tick_period: Option<Duration>,
    state: Arc<Mutex<State>>,
    callback: Arc<Mutex<Option<TimerCallback>>>,
}

impl Device {
    /// Gets a mock device with the 15 melodic channels and percussion channel of a GM module.
    pub fn get(name: &str) -> Device {
        Device::with_channels(name, 15)
    }

    /// Gets a mock device with the given number of melodic channels.
    pub fn with_channels(name: &str, count: usize) -> Device {
        let channels = (0..16u8)
            .filter(|channel| *channel != GM_PERCUSSION_CHANNEL)
            .take(count)
            .map(|channel| (ChannelId(channel), false))
            .collect();
        Device {
            name: name.to_string(),
            base_tempo: DEFAULT_BASE_TEMPO,
            tick_period: None,
            state: Arc::new(Mutex::new(State {
                open: false,
                channels,
                percussion: Some(ChannelId(GM_PERCUSSION_CHANNEL)),
                messages: Vec::new(),
                timer: None,
            })),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Drives the registered callback from a timer thread with the given period.
    pub fn ticking(mut self, period: Duration) -> Device {
        self.base_tempo = u32::try_from(period.as_micros()).unwrap_or(u32::MAX).max(1);
        self.tick_period = Some(period);
        self
    }

    #[cfg(test)]
    /// Sets the reported base tempo without starting a timer thread.
    pub fn with_base_tempo(mut self, base_tempo: u32) -> Device {
        self.base_tempo = base_tempo;
        self
    }

    #[cfg(test)]
    /// Fires the registered timer callback once on the calling thread.
    pub fn fire_timer(&self) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    #[cfg(test)]
    /// Returns true if a timer callback is registered.
    pub fn has_timer_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    #[cfg(test)]
    /// Returns every message sent so far.
    pub fn messages(&self) -> Vec<(ChannelId, MidiMessage)> {
        self.state.lock().messages.clone()
    }

    #[cfg(test)]
    /// Forgets the recorded messages.
    pub fn clear_messages(&self) {
        self.state.lock().messages.clear();
    }

    #[cfg(test)]
    /// Returns the channels currently allocated.
    pub fn allocated_channels(&self) -> Vec<ChannelId> {
        self.state
            .lock()
            .channels
            .iter()
            .filter(|(_, allocated)| *allocated)
            .map(|(channel, _)| *channel)
            .collect()
    }

    #[cfg(test)]
    /// Returns true if the device is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    #[cfg(test)]
    /// Returns the most recent value of the given controller on the channel.
    pub fn last_controller(&self, channel: ChannelId, controller: u8) -> Option<u8> {
        self.state
            .lock()
            .messages
            .iter()
            .rev()
            .find_map(|(ch, message)| match message {
                MidiMessage::Controller {
                    controller: c,
                    value,
                } if *ch == channel && c.as_int() == controller => Some(value.as_int()),
                _ => None,
            })
    }

    #[cfg(test)]
    /// Returns the notes played on the channel in order.
    pub fn notes_on(&self, channel: ChannelId) -> Vec<u8> {
        self.state
            .lock()
            .messages
            .iter()
            .filter_map(|(ch, message)| match message {
                MidiMessage::NoteOn { key, vel } if *ch == channel && vel.as_int() > 0 => {
                    Some(key.as_int())
                }
                _ => None,
            })
            .collect()
    }

    #[cfg(test)]
    /// Returns the notes released on the channel in order.
    pub fn notes_off(&self, channel: ChannelId) -> Vec<u8> {
        self.state
            .lock()
            .messages
            .iter()
            .filter_map(|(ch, message)| match message {
                MidiMessage::NoteOff { key, .. } if *ch == channel => Some(key.as_int()),
                MidiMessage::NoteOn { key, vel } if *ch == channel && vel.as_int() == 0 => {
                    Some(key.as_int())
                }
                _ => None,
            })
            .collect()
    }
}

impl super::Device for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&self) -> Result<(), Box<dyn Error>> {
        let mut state = self.state.lock();
        if state.open {
            return Err(format!("{} is already open", self.name).into());
        }
        state.open = true;
        info!(device = self.name, "Opened mock device.");
        Ok(())
    }

    fn close(&self) {
        super::Device::set_timer_callback(self, None);
        let mut state = self.state.lock();
        state.open = false;
        state
            .channels
            .iter_mut()
            .for_each(|(_, allocated)| *allocated = false);
        info!(device = self.name, "Closed mock device.");
    }

    fn allocate_channel(&self) -> Option<ChannelId> {
        let mut state = self.state.lock();
        let (channel, allocated) = state
            .channels
            .iter_mut()
            .find(|(_, allocated)| !*allocated)?;
        *allocated = true;
        Some(*channel)
    }

    fn release_channel(&self, channel: ChannelId) {
        let mut state = self.state.lock();
        match state.channels.iter_mut().find(|(ch, _)| *ch == channel) {
            Some((_, allocated)) => *allocated = false,
            None => debug!(channel = channel.as_int(), "Released unknown channel."),
        }
    }

    fn percussion_channel(&self) -> Option<ChannelId> {
        self.state.lock().percussion
    }

    fn send(&self, channel: ChannelId, message: MidiMessage) {
        self.state.lock().messages.push((channel, message));
    }

    fn base_tempo(&self) -> u32 {
        self.base_tempo
    }

    fn set_timer_callback(&self, callback: Option<TimerCallback>) {
        // Stop the old thread before swapping so the old callback can't race the new one.
        let old_timer = self.state.lock().timer.take();
        drop(old_timer);

        *self.callback.lock() = callback.clone();
        if let (Some(period), Some(callback)) = (self.tick_period, callback) {
            self.state.lock().timer = Some(Timer::start(period, callback));
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}
