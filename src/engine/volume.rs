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

/// The number of shared volume groups players can be assigned to.
pub const VOLUME_GROUPS: usize = 8;

const MAX_MASTER: u64 = 255;
const MAX_MUSIC: u64 = 255;
const MAX_CHANNEL: u64 = 127;

/// The engine-wide volume layers that sit above the player and part volumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    pub master: u8,
    pub music: u8,
    pub groups: [u8; VOLUME_GROUPS],
}

impl Default for Volume {
    fn default() -> Self {
        Volume {
            master: 255,
            music: 255,
            groups: [127; VOLUME_GROUPS],
        }
    }
}

impl Volume {
    /// Returns the group level, or full volume for an out of range group.
    pub fn group(&self, group: u8) -> u8 {
        self.groups.get(usize::from(group)).copied().unwrap_or(127)
    }

    /// Combines every layer into the 0..=127 value sent to a channel. Each layer is normalized
    /// to its maximum and the product is rounded to the nearest step.
    pub fn effective(&self, group: u8, player: u8, part: u8) -> u8 {
        let numerator = u64::from(self.master)
            * u64::from(self.music)
            * u64::from(self.group(group).min(127))
            * u64::from(player.min(127))
            * u64::from(part.min(127))
            * MAX_CHANNEL;
        let denominator = MAX_MASTER * MAX_MUSIC * MAX_CHANNEL * MAX_CHANNEL * MAX_CHANNEL;
        ((numerator + denominator / 2) / denominator).min(MAX_CHANNEL) as u8
    }
}

#[cfg(test)]
mod test {
    use super::Volume;

    #[test]
    fn full_volume_is_full_scale() {
        let volume = Volume::default();
        assert_eq!(127, volume.effective(0, 127, 127));
        assert_eq!(0, volume.effective(0, 0, 127));
    }

    #[test]
    fn layers_multiply() {
        let mut volume = Volume::default();
        volume.master = 128;
        assert_eq!(64, volume.effective(0, 127, 127));

        volume.master = 255;
        volume.groups[3] = 64;
        assert_eq!(64, volume.effective(3, 127, 127));
        assert_eq!(127, volume.effective(2, 127, 127));
        assert_eq!(32, volume.effective(3, 127, 64));
    }

    #[test]
    fn out_of_range_group_is_full() {
        let volume = Volume::default();
        assert_eq!(127, volume.effective(200, 127, 127));
    }
}
