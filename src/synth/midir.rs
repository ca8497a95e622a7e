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
use std::{error::Error, fmt, time::Duration};

use midir::{MidiOutput, MidiOutputConnection, MidiOutputPort};
use midly::{live::LiveEvent, num::u4, MidiMessage};
use parking_lot::Mutex;
use tracing::{debug, error, info, span, warn, Level};

use super::{timer::Timer, ChannelId, TimerCallback, GM_PERCUSSION_CHANNEL};

/// A General MIDI output port. Channels 0-15 are handed out as melodic channels except the
/// percussion channel.
pub struct Device {
    name: String,
    output_port: MidiOutputPort,
    base_tempo: u32,
    timer_period: Duration,
    connection: Mutex<Option<MidiOutputConnection>>,
    /// Bit n set means channel n is allocated.
    allocated: Mutex<u16>,
    timer: Mutex<Option<Timer>>,
}

impl Device {
    fn new(name: String, output_port: MidiOutputPort, timer_period: Duration) -> Device {
        Device {
            name,
            output_port,
            base_tempo: u32::try_from(timer_period.as_micros())
                .unwrap_or(u32::MAX)
                .max(1),
            timer_period,
            connection: Mutex::new(None),
            // The percussion channel is never allocatable.
            allocated: Mutex::new(1 << GM_PERCUSSION_CHANNEL),
            timer: Mutex::new(None),
        }
    }
}

impl super::Device for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&self) -> Result<(), Box<dyn Error>> {
        let span = span!(Level::INFO, "open device (midir)");
        let _enter = span.enter();

        let mut connection = self.connection.lock();
        if connection.is_some() {
            return Err(format!("{} is already open", self.name).into());
        }

        let output = MidiOutput::new("imuse output")?;
        *connection = Some(
            output
                .connect(&self.output_port, "imuse")
                .map_err(|e| format!("unable to connect to {}: {}", self.name, e))?,
        );
        info!(device = self.name, "Opened MIDI output.");
        Ok(())
    }

    fn close(&self) {
        super::Device::set_timer_callback(self, None);

        // Leave nothing ringing on the way out.
        for channel in 0..16 {
            super::Device::all_notes_off(self, ChannelId(channel));
        }
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
        }
        *self.allocated.lock() = 1 << GM_PERCUSSION_CHANNEL;
        info!(device = self.name, "Closed MIDI output.");
    }

    fn allocate_channel(&self) -> Option<ChannelId> {
        let mut allocated = self.allocated.lock();
        let channel = (0..16u8).find(|channel| *allocated & (1 << channel) == 0)?;
        *allocated |= 1 << channel;
        Some(ChannelId(channel))
    }

    fn release_channel(&self, channel: ChannelId) {
        if channel.as_int() == GM_PERCUSSION_CHANNEL || channel.as_int() >= 16 {
            debug!(channel = channel.as_int(), "Ignoring release of reserved channel.");
            return;
        }
        *self.allocated.lock() &= !(1 << channel.as_int());
    }

    fn percussion_channel(&self) -> Option<ChannelId> {
        Some(ChannelId(GM_PERCUSSION_CHANNEL))
    }

    fn send(&self, channel: ChannelId, message: MidiMessage) {
        let event = LiveEvent::Midi {
            channel: u4::from_int_lossy(channel.as_int()),
            message,
        };
        let mut buf: Vec<u8> = Vec::with_capacity(8);
        if let Err(e) = event.write(&mut buf) {
            error!(err = ?e, "Error encoding MIDI event.");
            return;
        }

        let mut connection = self.connection.lock();
        match connection.as_mut() {
            Some(connection) => {
                if let Err(e) = connection.send(&buf) {
                    error!(err = e.to_string(), device = self.name, "Error sending MIDI event.");
                }
            }
            None => warn!(device = self.name, "Device is not open, dropping MIDI event."),
        }
    }

    fn base_tempo(&self) -> u32 {
        self.base_tempo
    }

    fn set_timer_callback(&self, callback: Option<TimerCallback>) {
        let old_timer = self.timer.lock().take();
        drop(old_timer);

        if let Some(callback) = callback {
            *self.timer.lock() = Some(Timer::start(self.timer_period, callback));
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Output)", self.name)
    }
}

/// Lists the MIDI output ports.
pub fn list() -> Result<Vec<Box<dyn super::Device>>, Box<dyn Error>> {
    Ok(list_midir_devices(Duration::from_millis(10))?
        .into_iter()
        .map(|device| {
            let device: Box<dyn super::Device> = Box::new(device);
            device
        })
        .collect())
}

fn list_midir_devices(timer_period: Duration) -> Result<Vec<Device>, Box<dyn Error>> {
    let output = MidiOutput::new("imuse output listing")?;
    let mut devices = Vec::new();
    for port in output.ports() {
        let name = output.port_name(&port)?;
        devices.push(Device::new(name, port, timer_period));
    }
    Ok(devices)
}

/// Gets the output port whose name contains the given name.
pub fn get(name: &str, timer_period: Duration) -> Result<Device, Box<dyn Error>> {
    let mut matches = list_midir_devices(timer_period)?
        .into_iter()
        .filter(|device| device.name.contains(name))
        .collect::<Vec<Device>>();

    if matches.is_empty() {
        return Err(format!("no MIDI output device found with name {}", name).into());
    }
    if matches.len() > 1 {
        return Err(format!(
            "found too many MIDI output devices ({}) with name {}: {}",
            matches.len(),
            name,
            matches
                .iter()
                .map(|device| device.name.clone())
                .collect::<Vec<String>>()
                .join(", ")
        )
        .into());
    }

    Ok(matches.swap_remove(0))
}
