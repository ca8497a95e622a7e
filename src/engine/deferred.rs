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
use super::Command;

pub const MAX_DEFERRED: usize = 4;

/// A command waiting for its timer tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deferred {
    /// Timer ticks left.
    pub ticks: u32,
    pub command: Command,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeferredCommands {
    pub(super) slots: [Option<Deferred>; MAX_DEFERRED],
}

/// Converts hundredths of a second into timer ticks of `base_tempo` microseconds, rounding up.
/// Every command waits at least one tick. A device that reports no period runs commands on
/// the next tick.
pub fn hundredths_to_ticks(hundredths: u32, base_tempo: u32) -> u32 {
    if base_tempo == 0 {
        return 1;
    }
    let usec = u64::from(hundredths) * 10_000;
    let ticks = usec.div_ceil(u64::from(base_tempo));
    u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
}

impl DeferredCommands {
    /// Stores a command in a free slot. Returns false if every slot is taken.
    pub fn schedule(&mut self, hundredths: u32, base_tempo: u32, command: Command) -> bool {
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            return false;
        };
        *slot = Some(Deferred {
            ticks: hundredths_to_ticks(hundredths, base_tempo),
            command,
        });
        true
    }

    /// Counts every slot down, returning the commands that came due in slot order.
    pub fn advance(&mut self, ticks: u32) -> Vec<Command> {
        let mut due = Vec::new();
        for slot in self.slots.iter_mut() {
            let Some(deferred) = slot.as_mut() else {
                continue;
            };
            deferred.ticks = deferred.ticks.saturating_sub(ticks);
            if deferred.ticks == 0 {
                due.push(deferred.command);
                *slot = None;
            }
        }
        due
    }

    pub fn clear(&mut self) {
        self.slots = [None; MAX_DEFERRED];
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use crate::engine::Command;

    use super::{hundredths_to_ticks, DeferredCommands, MAX_DEFERRED};

    #[test]
    fn conversion_rounds_up() {
        assert_eq!(100, hundredths_to_ticks(100, 10_000));
        assert_eq!(1, hundredths_to_ticks(0, 10_000));
        // 10ms at a 3ms period is 3.33 ticks.
        assert_eq!(4, hundredths_to_ticks(1, 3_000));
        assert_eq!(1, hundredths_to_ticks(1, 0));
        assert_eq!(1, hundredths_to_ticks(500, 0));
    }

    #[test]
    fn due_in_slot_order() {
        let mut deferred = DeferredCommands::default();
        assert!(deferred.schedule(3, 10_000, Command::new(1, &[])));
        assert!(deferred.schedule(1, 10_000, Command::new(2, &[])));
        assert!(deferred.schedule(3, 10_000, Command::new(3, &[])));

        assert_eq!(vec![2], opcodes(deferred.advance(1)));
        assert!(deferred.advance(1).is_empty());
        assert_eq!(vec![1, 3], opcodes(deferred.advance(1)));
        assert_eq!(0, deferred.len());
    }

    #[test]
    fn full_table_drops() {
        let mut deferred = DeferredCommands::default();
        for _ in 0..MAX_DEFERRED {
            assert!(deferred.schedule(10, 10_000, Command::new(1, &[])));
        }
        assert!(!deferred.schedule(10, 10_000, Command::new(2, &[])));
        deferred.clear();
        assert_eq!(0, deferred.len());
    }

    fn opcodes(commands: Vec<Command>) -> Vec<i32> {
        commands.into_iter().map(|command| command.opcode).collect()
    }
}
