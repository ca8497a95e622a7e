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

//! The marker queue. Scripts record a trigger followed by the commands to run
//! when the music reaches it; markers from the music drain it strictly in
//! order, one trigger at a time.

use tracing::warn;

use crate::sound::SoundId;

use super::{command::END_OF_LIST, Command, CommandError};

pub const QUEUE_SIZE: usize = 64;

/// Words per entry in the saved form.
pub const ENTRY_WORDS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueEntry {
    #[default]
    Empty,
    Trigger {
        sound: SoundId,
        marker: u8,
    },
    Command(Command),
}

impl QueueEntry {
    pub fn to_words(self) -> [i32; ENTRY_WORDS] {
        let mut words = [0; ENTRY_WORDS];
        match self {
            QueueEntry::Empty => {}
            QueueEntry::Trigger { sound, marker } => {
                words[0] = 1;
                words[1] = i32::from(sound);
                words[2] = i32::from(marker);
            }
            QueueEntry::Command(command) => {
                words[0] = 2;
                words[1] = command.opcode;
                words[2..].copy_from_slice(&command.args);
            }
        }
        words
    }

    /// Rebuilds an entry from its saved form. Anything unrecognised comes back empty.
    pub fn from_words(words: [i32; ENTRY_WORDS]) -> QueueEntry {
        match words[0] {
            1 => QueueEntry::Trigger {
                sound: SoundId::try_from(words[1]).unwrap_or_default(),
                marker: u8::try_from(words[2]).unwrap_or_default(),
            },
            2 => QueueEntry::Command(Command::new(words[1], &words[2..])),
            _ => QueueEntry::Empty,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CommandQueue {
    pub(super) entries: [QueueEntry; QUEUE_SIZE],
    pub(super) read: usize,
    pub(super) write: usize,
    /// True between a trigger and its end of list sentinel.
    pub(super) adding: bool,
    /// Triggers fully recorded and not yet reached.
    pub(super) trigger_count: u32,
    /// The trigger most recently recorded.
    pub(super) recording: Option<(SoundId, u8)>,
    cleared: bool,
}

impl Default for CommandQueue {
    fn default() -> Self {
        CommandQueue {
            entries: [QueueEntry::Empty; QUEUE_SIZE],
            read: 0,
            write: 0,
            adding: false,
            trigger_count: 0,
            recording: None,
            cleared: false,
        }
    }
}

impl CommandQueue {
    fn next(index: usize) -> usize {
        (index + 1) % QUEUE_SIZE
    }

    /// Starts recording commands for a marker.
    pub fn enqueue_trigger(&mut self, sound: SoundId, marker: u8) -> Result<(), CommandError> {
        let next = Self::next(self.write);
        if next == self.read {
            warn!(sound, marker, "Command queue full, dropping trigger.");
            return Err(CommandError::QueueFull);
        }
        self.entries[self.write] = QueueEntry::Trigger { sound, marker };
        self.write = next;
        self.adding = true;
        self.recording = Some((sound, marker));
        Ok(())
    }

    /// Adds a command to the trigger being recorded. The end of list sentinel closes the
    /// trigger and takes no slot.
    pub fn enqueue_command(&mut self, command: Command) -> Result<(), CommandError> {
        if self.write == self.read {
            return Err(CommandError::NotRecording);
        }
        if command.opcode == END_OF_LIST {
            self.adding = false;
            self.trigger_count += 1;
            return Ok(());
        }

        let next = Self::next(self.write);
        if next == self.read {
            warn!(opcode = command.opcode, "Command queue full, dropping command.");
            return Err(CommandError::QueueFull);
        }
        self.entries[self.write] = QueueEntry::Command(command);
        self.write = next;
        Ok(())
    }

    /// Checks a marker against the head of the queue. On a match the caller drains the
    /// trigger's commands with `next_command`.
    pub fn begin_marker(&mut self, sound: SoundId, marker: u8) -> bool {
        if self.adding && self.recording == Some((sound, marker)) {
            return false;
        }

        while self.read != self.write && self.entries[self.read] == QueueEntry::Empty {
            warn!(position = self.read, "Skipping empty command queue slot.");
            self.read = Self::next(self.read);
        }
        if self.read == self.write {
            return false;
        }

        match self.entries[self.read] {
            QueueEntry::Trigger {
                sound: head_sound,
                marker: head_marker,
            } if head_sound == sound && head_marker == marker => {
                self.trigger_count = self.trigger_count.saturating_sub(1);
                self.cleared = false;
                true
            }
            _ => false,
        }
    }

    /// Takes the next command of the trigger being drained. Stops at the next trigger or the
    /// end of the queue, leaving the read position there.
    pub fn next_command(&mut self) -> Option<Command> {
        if self.read == self.write {
            return None;
        }
        let position = Self::next(self.read);
        self.read = position;
        if position == self.write {
            return None;
        }
        match self.entries[position] {
            QueueEntry::Command(command) => Some(command),
            _ => None,
        }
    }

    /// True if the queue was cleared since the last marker matched.
    pub fn was_cleared(&self) -> bool {
        self.cleared
    }

    pub fn clear(&mut self) {
        *self = CommandQueue {
            cleared: true,
            ..CommandQueue::default()
        };
    }

    pub fn query(&self, param: i32) -> i32 {
        let head = (self.read != self.write).then(|| self.entries[self.read].to_words());
        match param {
            0 => self.trigger_count as i32,
            1 => head.map(|words| words[1]).unwrap_or(-1),
            2 => head.map(|words| words[2]).unwrap_or(0xFF),
            _ => -1,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::engine::{command::END_OF_LIST, Command};

    use super::{CommandQueue, QueueEntry, QUEUE_SIZE};

    fn record(queue: &mut CommandQueue, sound: u16, marker: u8, opcodes: &[i32]) {
        queue.enqueue_trigger(sound, marker).unwrap();
        for opcode in opcodes {
            queue.enqueue_command(Command::new(*opcode, &[])).unwrap();
        }
        queue.enqueue_command(Command::new(END_OF_LIST, &[])).unwrap();
    }

    fn drain(queue: &mut CommandQueue) -> Vec<i32> {
        std::iter::from_fn(|| queue.next_command())
            .map(|command| command.opcode)
            .collect()
    }

    #[test]
    fn triggers_drain_in_order_once() {
        let mut queue = CommandQueue::default();
        record(&mut queue, 1, 5, &[10, 11]);
        record(&mut queue, 1, 6, &[12]);
        assert_eq!(2, queue.query(0));

        assert!(!queue.begin_marker(1, 6));
        assert!(queue.begin_marker(1, 5));
        assert_eq!(vec![10, 11], drain(&mut queue));
        assert!(!queue.begin_marker(1, 5));
        assert_eq!(1, queue.query(0));

        assert!(queue.begin_marker(1, 6));
        assert_eq!(vec![12], drain(&mut queue));
        assert_eq!(0, queue.query(0));
        assert_eq!(-1, queue.query(1));
        assert_eq!(0xFF, queue.query(2));
    }

    #[test]
    fn marker_being_recorded_is_ignored() {
        let mut queue = CommandQueue::default();
        queue.enqueue_trigger(2, 1).unwrap();
        queue.enqueue_command(Command::new(7, &[])).unwrap();
        assert!(!queue.begin_marker(2, 1));
        queue.enqueue_command(Command::new(END_OF_LIST, &[])).unwrap();
        assert!(queue.begin_marker(2, 1));
    }

    #[test]
    fn commands_need_a_trigger() {
        let mut queue = CommandQueue::default();
        assert!(queue.enqueue_command(Command::new(7, &[])).is_err());
        assert!(queue.enqueue_command(Command::new(END_OF_LIST, &[])).is_err());
    }

    #[test]
    fn full_queue_rejects() {
        let mut queue = CommandQueue::default();
        queue.enqueue_trigger(1, 1).unwrap();
        for _ in 0..QUEUE_SIZE - 2 {
            queue.enqueue_command(Command::new(3, &[])).unwrap();
        }
        assert!(queue.enqueue_command(Command::new(3, &[])).is_err());
        assert!(queue.enqueue_trigger(1, 2).is_err());
        // The sentinel takes no slot.
        queue.enqueue_command(Command::new(END_OF_LIST, &[])).unwrap();
        assert_eq!(1, queue.query(0));
    }

    #[test]
    fn empty_slots_are_skipped() {
        let mut queue = CommandQueue::default();
        record(&mut queue, 1, 1, &[9]);
        record(&mut queue, 1, 2, &[8]);
        queue.entries[0] = QueueEntry::Empty;
        queue.entries[1] = QueueEntry::Empty;
        // Skipping lands on the second trigger.
        assert!(queue.begin_marker(1, 2));
        assert_eq!(vec![8], drain(&mut queue));
    }

    #[test]
    fn head_words() {
        let mut queue = CommandQueue::default();
        record(&mut queue, 4, 9, &[]);
        assert_eq!(4, queue.query(1));
        assert_eq!(9, queue.query(2));

        queue.clear();
        assert!(queue.was_cleared());
        assert_eq!(0, queue.query(0));
        assert_eq!(-1, queue.query(1));
    }

    #[test]
    fn saved_words() {
        let command = Command::new(0x108, &[1, 2, 3]);
        let words = QueueEntry::Command(command).to_words();
        assert_eq!([2, 0x108, 1, 2, 3, 0, 0, 0], words);
        assert_eq!(QueueEntry::Command(command), QueueEntry::from_words(words));
        assert_eq!(QueueEntry::Empty, QueueEntry::from_words([7; 8]));
    }
}
