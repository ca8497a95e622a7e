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

//! Hooks let scripts arm conditional points in the music. A hook event in the
//! music data fires only when its value matches the value the script armed
//! (or when the music's value is 0, which always fires).

use super::CommandError;

/// Channel number that addresses every channel at once.
pub const ALL_CHANNELS: u8 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookClass {
    Jump = 0,
    Transpose = 1,
    PartOnOff = 2,
    PartVolume = 3,
    PartProgram = 4,
    PartTranspose = 5,
}

impl TryFrom<i32> for HookClass {
    type Error = CommandError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => HookClass::Jump,
            1 => HookClass::Transpose,
            2 => HookClass::PartOnOff,
            3 => HookClass::PartVolume,
            4 => HookClass::PartProgram,
            5 => HookClass::PartTranspose,
            _ => return Err(CommandError::InvalidArgument("hook class")),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hooks {
    /// The armed jump and the one it replaced.
    pub jump: [u8; 2],
    pub transpose: u8,
    pub part_onoff: [u8; 16],
    pub part_volume: [u8; 16],
    pub part_program: [u8; 16],
    pub part_transpose: [u8; 16],
}

impl Hooks {
    fn per_channel(&mut self, class: HookClass) -> Option<&mut [u8; 16]> {
        match class {
            HookClass::PartOnOff => Some(&mut self.part_onoff),
            HookClass::PartVolume => Some(&mut self.part_volume),
            HookClass::PartProgram => Some(&mut self.part_program),
            HookClass::PartTranspose => Some(&mut self.part_transpose),
            HookClass::Jump | HookClass::Transpose => None,
        }
    }

    /// Arms a hook.
    pub fn set(&mut self, class: HookClass, value: u8, channel: u8) -> Result<(), CommandError> {
        match class {
            HookClass::Jump => {
                if value != self.jump[0] {
                    self.jump[1] = self.jump[0];
                }
                self.jump[0] = value;
            }
            HookClass::Transpose => self.transpose = value,
            _ => {
                let slots = self
                    .per_channel(class)
                    .ok_or(CommandError::InvalidArgument("hook class"))?;
                if channel == ALL_CHANNELS {
                    slots.fill(value);
                } else {
                    *slots
                        .get_mut(usize::from(channel))
                        .ok_or(CommandError::InvalidArgument("hook channel"))? = value;
                }
            }
        }
        Ok(())
    }

    /// Checks a hook event from the music. Returns true if it should fire, clearing one-shot
    /// slots on the way.
    pub fn consume(&mut self, class: HookClass, value: u8, channel: u8) -> bool {
        match class {
            HookClass::Jump => {
                if value != 0 && value != self.jump[0] {
                    return false;
                }
                if value != 0 && value < 0x80 {
                    self.jump[0] = self.jump[1];
                    self.jump[1] = 0;
                }
                true
            }
            HookClass::Transpose => consume_slot(&mut self.transpose, value),
            _ => match self
                .per_channel(class)
                .and_then(|slots| slots.get_mut(usize::from(channel)))
            {
                Some(slot) => consume_slot(slot, value),
                None => false,
            },
        }
    }

    /// Returns the armed value behind a player parameter number (18..=23).
    pub fn query(&self, param: i32, channel: i32) -> i32 {
        let channel = match usize::try_from(channel) {
            Ok(channel) if channel < 16 => Some(channel),
            _ => None,
        };
        match (param, channel) {
            (18, _) => i32::from(self.jump[0]),
            (19, _) => i32::from(self.transpose),
            (20, Some(channel)) => i32::from(self.part_onoff[channel]),
            (21, Some(channel)) => i32::from(self.part_volume[channel]),
            (22, Some(channel)) => i32::from(self.part_program[channel]),
            (23, Some(channel)) => i32::from(self.part_transpose[channel]),
            _ => -1,
        }
    }
}

fn consume_slot(slot: &mut u8, value: u8) -> bool {
    if value != 0 && value != *slot {
        return false;
    }
    if value < 0x80 {
        *slot = 0;
    }
    true
}
