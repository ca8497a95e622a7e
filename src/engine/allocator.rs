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

//! Scarce resource arbitration. Players, parts and device channels are all
//! handed out by priority: a request either finds a free slot, evicts a lower
//! priority occupant, or is denied. Nothing ever waits.

use tracing::debug;

use super::{Engine, PartId, PlayerId, MAX_PARTS, MAX_PLAYERS};

impl Engine {
    /// Finds a player slot for a sound of the given priority, evicting the lowest priority
    /// player if it is strictly lower (or if players are always recycled).
    pub(super) fn allocate_player(&mut self, priority: u8) -> Option<PlayerId> {
        let limit = self.properties.player_limit.clamp(1, MAX_PLAYERS);
        if let Some(pid) = (0..limit).find(|pid| !self.players[*pid].active) {
            return Some(pid);
        }

        let mut lowest: Option<PlayerId> = None;
        for pid in 0..limit {
            match lowest {
                Some(current) if self.players[pid].priority >= self.players[current].priority => {}
                _ => lowest = Some(pid),
            }
        }
        let victim = lowest?;
        let victim_priority = self.players[victim].priority;

        if victim_priority < priority || self.properties.recycle_players {
            debug!(
                sound = self.players[victim].id,
                priority = victim_priority,
                requested = priority,
                "Evicting player."
            );
            self.clear_player(victim);
            // Triggers fired by the eviction may have claimed the slot again.
            return (!self.players[victim].active).then_some(victim);
        }

        debug!(
            lowest = victim_priority,
            requested = priority,
            "No player slot available."
        );
        None
    }

    /// Finds a free part, or evicts the part with the lowest effective priority not above the
    /// request.
    pub(super) fn allocate_part(&mut self, priority: u8) -> Option<PartId> {
        if let Some(part_id) = self.parts.iter().position(|part| part.player.is_none()) {
            return Some(part_id);
        }

        let mut lowest: Option<PartId> = None;
        for (part_id, part) in self.parts.iter().enumerate() {
            if part.pri_eff > priority {
                continue;
            }
            match lowest {
                Some(current) if part.pri_eff >= self.parts[current].pri_eff => {}
                _ => lowest = Some(part_id),
            }
        }

        let Some(part_id) = lowest else {
            debug!(requested = priority, "No part available.");
            return None;
        };
        self.evict_part(part_id);
        Some(part_id)
    }

    /// Takes a part away from its player.
    fn evict_part(&mut self, part_id: PartId) {
        let part = &self.parts[part_id];
        debug!(part = part_id, priority = part.pri_eff, "Evicting part.");
        if let Some(pid) = part.player {
            let channel = usize::from(part.channel);
            if self.players[pid].parts.get(channel).copied().flatten() == Some(part_id) {
                self.players[pid].parts[channel] = None;
            }
        }
        self.parts[part_id].uninit(self.device.as_ref());
    }

    /// Returns the player's part for a track channel, setting one up if the channel is new.
    pub(super) fn player_part(&mut self, pid: PlayerId, channel: u8) -> Option<PartId> {
        let channel = channel & 0x0F;
        if let Some(part_id) = self.players[pid].parts[usize::from(channel)] {
            return Some(part_id);
        }

        let part_id = self.allocate_part(self.players[pid].priority)?;
        self.parts[part_id].setup(pid, channel);
        self.players[pid].parts[usize::from(channel)] = Some(part_id);
        self.refresh_part(part_id);
        self.reallocate_channels();
        Some(part_id)
    }

    /// Binds device channels to the highest priority parts that want one, stealing from lower
    /// priority parts when the device runs out.
    pub(super) fn reallocate_channels(&mut self) {
        let mut skipped: u64 = 0;
        loop {
            let mut candidate: Option<PartId> = None;
            for (part_id, part) in self.parts.iter().enumerate() {
                if !part.wants_channel() || part.hw.is_some() || skipped & (1 << part_id) != 0 {
                    continue;
                }
                match candidate {
                    Some(current) if part.pri_eff <= self.parts[current].pri_eff => {}
                    _ => candidate = Some(part_id),
                }
            }
            let Some(part_id) = candidate else {
                return;
            };

            if let Some(channel) = self.device.allocate_channel() {
                debug!(part = part_id, channel = channel.as_int(), "Bound channel.");
                self.parts[part_id].bind(self.device.as_ref(), channel);
                continue;
            }

            let mut victim: Option<PartId> = None;
            for (other, part) in self.parts.iter().enumerate() {
                if part.hw.is_none() {
                    continue;
                }
                match victim {
                    Some(current) if part.pri_eff >= self.parts[current].pri_eff => {}
                    _ => victim = Some(other),
                }
            }

            match victim {
                Some(victim) if self.parts[victim].pri_eff < self.parts[part_id].pri_eff => {
                    debug!(
                        part = part_id,
                        victim,
                        priority = self.parts[part_id].pri_eff,
                        victim_priority = self.parts[victim].pri_eff,
                        "Stealing channel."
                    );
                    self.parts[victim].unbind(self.device.as_ref());
                }
                _ => skipped |= 1 << part_id,
            }
        }
    }
}

const _: () = assert!(MAX_PARTS <= 64);

#[cfg(test)]
mod test {
    use std::error::Error;

    use crate::{
        engine::{
            test::{engine, sound},
            MAX_PARTS,
        },
        synth::MockDevice as Device,
    };

    #[test]
    fn ties_go_to_first_part() -> Result<(), Box<dyn Error>> {
        let device = Device::with_channels("mock", 1);
        let mut engine = engine(&device, vec![sound(1, 80, &[3, 5])?]);
        engine.start_sound(1)?;
        engine.on_timer();

        let bound: Vec<usize> = engine
            .parts()
            .iter()
            .enumerate()
            .filter(|(_, part)| part.hw.is_some())
            .map(|(id, _)| id)
            .collect();
        assert_eq!(vec![0], bound);
        engine.check_invariants()?;
        Ok(())
    }

    #[test]
    fn disabled_parts_give_up_channels() -> Result<(), Box<dyn Error>> {
        let device = Device::with_channels("mock", 1);
        let mut engine = engine(&device, vec![sound(1, 80, &[0])?, sound(2, 20, &[0])?]);
        engine.start_sound(1)?;
        engine.start_sound(2)?;
        engine.on_timer();
        let high = engine.find_player(1).unwrap();
        assert!(engine.parts()[0].hw.is_some());
        assert!(engine.parts()[1].hw.is_none());

        engine.set_part_enabled(high, 0, false);
        assert!(engine.parts()[0].hw.is_none());
        assert!(engine.parts()[1].hw.is_some());

        engine.set_part_enabled(high, 0, true);
        assert!(engine.parts()[0].hw.is_some());
        assert!(engine.parts()[1].hw.is_none());
        engine.check_invariants()?;
        Ok(())
    }

    #[test]
    fn raising_player_priority_steals() -> Result<(), Box<dyn Error>> {
        let device = Device::with_channels("mock", 1);
        let mut engine = engine(&device, vec![sound(1, 80, &[0])?, sound(2, 20, &[0])?]);
        engine.start_sound(1)?;
        engine.start_sound(2)?;
        engine.on_timer();
        let low = engine.find_player(2).unwrap();

        engine.set_player_priority(low, 90)?;
        assert!(engine.parts()[0].hw.is_none());
        assert!(engine.parts()[1].hw.is_some());
        engine.check_invariants()?;
        Ok(())
    }

    #[test]
    fn percussion_never_takes_a_channel() -> Result<(), Box<dyn Error>> {
        let device = Device::with_channels("mock", 2);
        let mut engine = engine(&device, vec![sound(1, 80, &[9])?]);
        engine.start_sound(1)?;
        engine.on_timer();
        assert!(device.allocated_channels().is_empty());
        assert_eq!(vec![60], device.notes_on(crate::synth::ChannelId(9)));
        Ok(())
    }

    #[test]
    fn part_pool_eviction() -> Result<(), Box<dyn Error>> {
        let device = Device::get("mock");
        let channels: Vec<u8> = (0..16).collect();
        let mut engine = engine(
            &device,
            vec![
                sound(1, 10, &channels)?,
                sound(2, 20, &channels)?,
                sound(3, 30, &[0])?,
                sound(4, 5, &[0])?,
            ],
        );
        engine.start_sound(1)?;
        engine.start_sound(2)?;
        engine.on_timer();
        assert!(engine.parts().iter().all(|part| part.player.is_some()));

        // A higher priority player takes a part from the lowest.
        engine.start_sound(3)?;
        engine.on_timer();
        let third = engine.find_player(3).unwrap();
        assert!(engine.players()[third].parts[0].is_some());
        let first = engine.find_player(1).unwrap();
        assert_eq!(15, engine.players()[first].part_ids().count());

        // A lower priority player gets nothing.
        engine.start_sound(4)?;
        engine.on_timer();
        let fourth = engine.find_player(4).unwrap();
        assert_eq!(0, engine.players()[fourth].part_ids().count());
        assert_eq!(MAX_PARTS, engine.parts().iter().filter(|p| p.player.is_some()).count());
        engine.check_invariants()?;
        Ok(())
    }
}
