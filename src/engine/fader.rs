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
use super::CommandError;

/// The number of faders a player can run at once.
pub const MAX_FADERS: usize = 4;

/// The player parameter a fader drives. The discriminants are the codes scripts use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeKind {
    Volume = 1,
    Transpose = 3,
    Speed = 4,
}

impl TryFrom<i32> for FadeKind {
    type Error = CommandError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FadeKind::Volume),
            3 => Ok(FadeKind::Transpose),
            4 => Ok(FadeKind::Speed),
            _ => Err(CommandError::InvalidArgument("fade kind")),
        }
    }
}

/// A linear ramp of one player parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fader {
    pub kind: FadeKind,
    pub start: i32,
    pub end: i32,
    pub total: u32,
    pub elapsed: u32,
}

impl Fader {
    pub fn value(&self) -> i32 {
        if self.total == 0 {
            return self.end;
        }
        let progress =
            (i64::from(self.end) - i64::from(self.start)) * i64::from(self.elapsed) / i64::from(self.total);
        self.start + progress as i32
    }

    pub fn done(&self) -> bool {
        self.elapsed >= self.total
    }
}

/// A step of a fader: the kind, the new value, and whether the fade finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FadeStep {
    pub kind: FadeKind,
    pub value: i32,
    pub done: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Faders {
    pub slots: [Option<Fader>; MAX_FADERS],
}

impl Faders {
    /// Starts a fade. A fade of the same kind already running is replaced.
    pub fn add(&mut self, kind: FadeKind, start: i32, end: i32, ticks: u32) -> Result<(), CommandError> {
        let fader = Fader {
            kind,
            start,
            end,
            total: ticks,
            elapsed: 0,
        };
        let index = self
            .slots
            .iter()
            .position(|slot| slot.is_some_and(|f| f.kind == kind))
            .or_else(|| self.slots.iter().position(Option::is_none))
            .ok_or(CommandError::NoFreeFader)?;
        self.slots[index] = Some(fader);
        Ok(())
    }

    /// Advances every fader by the given number of ticks, returning the values to apply.
    /// Finished faders are removed.
    pub fn advance(&mut self, ticks: u32) -> Vec<FadeStep> {
        let mut steps = Vec::new();
        for slot in self.slots.iter_mut() {
            let Some(fader) = slot.as_mut() else {
                continue;
            };
            fader.elapsed = fader.elapsed.saturating_add(ticks).min(fader.total);
            let step = FadeStep {
                kind: fader.kind,
                value: fader.value(),
                done: fader.done(),
            };
            if step.done {
                *slot = None;
            }
            steps.push(step);
        }
        steps
    }

    /// Stops any fade of the given kind.
    pub fn remove(&mut self, kind: FadeKind) {
        for slot in self.slots.iter_mut() {
            if slot.is_some_and(|fader| fader.kind == kind) {
                *slot = None;
            }
        }
    }

    /// True while a volume fade down to silence is running.
    pub fn fading_out(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|fader| fader.kind == FadeKind::Volume && fader.end == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn clear(&mut self) {
        self.slots = [None; MAX_FADERS];
    }
}
