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
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, info, span, Level, Span};

use crate::{
    engine::{save::SaveError, Command, CommandError, Engine, Properties, Property},
    sound::{SoundId, SoundLibrary},
    synth::{Device, TimerCallback},
};

/// The engine as scripts and the device timer see it. Every entry point takes the one engine
/// lock, so timer ticks and script calls never interleave.
pub struct IMuse {
    engine: Arc<Mutex<Engine>>,
    device: Arc<dyn Device>,
    terminated: AtomicBool,
    span: Span,
}

impl IMuse {
    /// Opens the device and starts taking timer ticks from it.
    pub fn new(
        device: Arc<dyn Device>,
        library: Arc<dyn SoundLibrary>,
        properties: Properties,
    ) -> Result<IMuse, Box<dyn Error>> {
        let span = span!(Level::INFO, "imuse", device = device.name());
        let enter = span.enter();

        device.open()?;
        let engine = Arc::new(Mutex::new(Engine::new(device.clone(), library, properties)));

        // The callback must not keep the engine alive, or dropping the facade would never
        // stop the timer.
        let weak = Arc::downgrade(&engine);
        let callback: TimerCallback = Arc::new(move || {
            if let Some(engine) = weak.upgrade() {
                engine.lock().on_timer();
            }
        });
        device.set_timer_callback(Some(callback));
        info!(base_tempo = device.base_tempo(), "Engine started.");

        drop(enter);
        Ok(IMuse {
            engine,
            device,
            terminated: AtomicBool::new(false),
            span,
        })
    }

    pub fn start_sound(&self, id: SoundId) -> Result<(), CommandError> {
        self.engine.lock().start_sound(id)
    }

    pub fn stop_sound(&self, id: SoundId) {
        self.engine.lock().stop_sound(id)
    }

    pub fn stop_all_sounds(&self) {
        self.engine.lock().stop_all_sounds()
    }

    /// Runs a script command. Failures come back as -1.
    pub fn do_command(&self, opcode: i32, args: &[i32]) -> i32 {
        let command = Command::new(opcode, args);
        match self.engine.lock().do_command(command) {
            Ok(result) => result,
            Err(e) => {
                let _enter = self.span.enter();
                debug!(err = e.to_string(), opcode, "Command failed.");
                -1
            }
        }
    }

    pub fn get_sound_status(&self, id: i32) -> i32 {
        self.engine.lock().sound_status(id)
    }

    pub fn set_music_volume(&self, volume: u8) {
        self.engine.lock().set_music_volume(volume)
    }

    pub fn set_master_volume(&self, volume: u8) {
        self.engine.lock().set_master_volume(volume)
    }

    pub fn property(&self, property: Property) -> u32 {
        self.engine.lock().property(property)
    }

    /// Sets a property, returning the previous value.
    pub fn set_property(&self, property: Property, value: u32) -> u32 {
        self.engine.lock().set_property(property, value)
    }

    pub fn save(&self) -> Vec<u8> {
        self.engine.lock().save()
    }

    pub fn load(&self, bytes: &[u8]) -> Result<(), SaveError> {
        self.engine.lock().load(bytes)
    }

    /// Runs one timer tick by hand.
    pub fn on_timer(&self) {
        self.engine.lock().on_timer()
    }

    /// Runs a function against the engine under the lock.
    pub fn with_engine<R>(&self, f: impl FnOnce(&Engine) -> R) -> R {
        f(&self.engine.lock())
    }

    /// Stops the timer, silences everything and closes the device. Later calls do nothing.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _enter = self.span.enter();

        // Removing the callback waits for a running tick, which needs the lock.
        self.device.set_timer_callback(None);
        self.engine.lock().terminate();
        self.device.close();
        info!("Engine closed.");
    }
}

impl Drop for IMuse {
    fn drop(&mut self) {
        self.terminate();
    }
}
