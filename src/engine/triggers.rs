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

//! The trigger table: one command per (sound, marker), fired when the sound
//! emits the marker or when its player is cleared.

use tracing::debug;

use crate::sound::SoundId;

use super::Command;

pub const MAX_TRIGGERS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub sound: SoundId,
    pub marker: u8,
    pub command: Command,
    /// Insertion stamp, compared against the table clock.
    pub age: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerTable {
    pub(super) entries: [Option<Trigger>; MAX_TRIGGERS],
    pub(super) clock: u32,
}

impl TriggerTable {
    /// Adds a trigger. An entry with the same sound, marker and opcode is replaced, otherwise
    /// the oldest entry makes room when the table is full.
    pub fn set(&mut self, sound: SoundId, marker: u8, command: Command) {
        self.clock = self.clock.wrapping_add(1);
        let clock = self.clock;

        let index = self
            .entries
            .iter()
            .position(|entry| {
                entry.is_some_and(|entry| {
                    entry.sound == sound
                        && entry.marker == marker
                        && entry.command.opcode == command.opcode
                })
            })
            .or_else(|| self.entries.iter().position(Option::is_none))
            .unwrap_or_else(|| {
                let oldest = self
                    .entries
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, entry)| entry.map(|e| clock.wrapping_sub(e.age)).unwrap_or(0))
                    .map(|(index, _)| index)
                    .unwrap_or(0);
                if let Some(evicted) = self.entries[oldest] {
                    debug!(
                        sound = evicted.sound,
                        marker = evicted.marker,
                        "Trigger table full, evicting oldest."
                    );
                }
                oldest
            });

        self.entries[index] = Some(Trigger {
            sound,
            marker,
            command,
            age: clock,
        });
    }

    /// Removes entries matching the sound and marker, where None matches anything. Returns how
    /// many were removed.
    pub fn clear(&mut self, sound: Option<SoundId>, marker: Option<u8>) -> usize {
        let mut removed = 0;
        for entry in self.entries.iter_mut() {
            let matches = entry.is_some_and(|trigger| {
                sound.is_none_or(|sound| trigger.sound == sound)
                    && marker.is_none_or(|marker| trigger.marker == marker)
            });
            if matches {
                *entry = None;
                removed += 1;
            }
        }
        removed
    }

    /// Removes and returns the commands of every entry the sound owns, in table order.
    pub fn take_owned(&mut self, sound: SoundId) -> Vec<Command> {
        let mut commands = Vec::new();
        for entry in self.entries.iter_mut() {
            if let Some(trigger) = entry.filter(|trigger| trigger.sound == sound) {
                commands.push(trigger.command);
                *entry = None;
            }
        }
        commands
    }

    /// Removes and returns the first entry matching a marker.
    pub fn take_matching(&mut self, sound: SoundId, marker: u8) -> Option<Command> {
        let entry = self.entries.iter_mut().find(|entry| {
            entry.is_some_and(|trigger| trigger.sound == sound && trigger.marker == marker)
        })?;
        entry.take().map(|trigger| trigger.command)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use crate::engine::Command;

    use super::{TriggerTable, MAX_TRIGGERS};

    #[test]
    fn reuse_and_evict_oldest() {
        let mut table = TriggerTable::default();
        table.set(1, 1, Command::new(8, &[2]));
        table.set(1, 1, Command::new(8, &[3]));
        assert_eq!(1, table.len());
        table.set(1, 1, Command::new(9, &[3]));
        assert_eq!(2, table.len());

        for marker in 2..MAX_TRIGGERS as u8 {
            table.set(2, marker, Command::new(8, &[]));
        }
        assert_eq!(MAX_TRIGGERS, table.len());

        // The (1, 1, 8) entry is the oldest, so it goes first.
        table.set(3, 0, Command::new(8, &[]));
        assert_eq!(MAX_TRIGGERS, table.len());
        assert_eq!(Some(Command::new(9, &[3])), table.take_matching(1, 1));
        assert_eq!(None, table.take_matching(1, 1));
    }

    #[test]
    fn clear_with_wildcards() {
        let mut table = TriggerTable::default();
        table.set(1, 1, Command::new(8, &[]));
        table.set(1, 2, Command::new(8, &[]));
        table.set(2, 1, Command::new(8, &[]));

        assert_eq!(1, table.clear(Some(1), Some(2)));
        assert_eq!(2, table.clear(None, Some(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn owned_entries_taken_together() {
        let mut table = TriggerTable::default();
        table.set(1, 1, Command::new(8, &[5]));
        table.set(2, 1, Command::new(8, &[6]));
        table.set(1, 3, Command::new(9, &[7]));

        let opcodes: Vec<i32> = table.take_owned(1).iter().map(|c| c.opcode).collect();
        assert_eq!(vec![8, 9], opcodes);
        assert_eq!(1, table.len());
    }
}
