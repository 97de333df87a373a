//! Per-party live snapshots, populated at socket connect.
//!
//! One entry per bound character or NPC, with a holder count so the same
//! character attached from two sockets survives the first disconnect.
//! Handlers mutate DP, status, and ability budgets directly on the entry;
//! those mutations are written through to the store at the same time.

use std::collections::HashMap;

use crate::model::{AbilityRecord, CharacterRecord, Id, NpcRecord};

#[derive(Debug, Clone)]
pub enum Snapshot {
    Character {
        chr: CharacterRecord,
        abilities: Vec<AbilityRecord>,
    },
    Npc {
        npc: NpcRecord,
    },
}

impl Snapshot {
    pub fn id(&self) -> &str {
        match self {
            Snapshot::Character { chr, .. } => &chr.id,
            Snapshot::Npc { npc } => &npc.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Snapshot::Character { chr, .. } => &chr.name,
            Snapshot::Npc { npc } => &npc.name,
        }
    }

    pub fn is_character(&self) -> bool {
        matches!(self, Snapshot::Character { .. })
    }
}

#[derive(Debug)]
struct Entry {
    snap: Snapshot,
    holders: u32,
}

#[derive(Debug, Default)]
pub struct StatsCache {
    entries: HashMap<Id, Entry>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install a snapshot for a newly bound socket. If another socket
    /// already holds this combatant the live entry is kept (it carries
    /// session mutations) and only the holder count grows.
    pub fn install(&mut self, snap: Snapshot) {
        let id = snap.id().to_string();
        match self.entries.get_mut(&id) {
            Some(e) => e.holders += 1,
            None => {
                self.entries.insert(id, Entry { snap, holders: 1 });
            }
        }
    }

    /// Drop one holder. Returns true when the entry was evicted.
    pub fn release(&mut self, id: &str) -> bool {
        let Some(e) = self.entries.get_mut(id) else {
            return false;
        };
        e.holders = e.holders.saturating_sub(1);
        if e.holders == 0 {
            self.entries.remove(id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &str) -> Option<&Snapshot> {
        self.entries.get(id).map(|e| &e.snap)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Snapshot> {
        self.entries.get_mut(id).map(|e| &mut e.snap)
    }

    pub fn character(&self, id: &str) -> Option<&CharacterRecord> {
        match self.get(id) {
            Some(Snapshot::Character { chr, .. }) => Some(chr),
            _ => None,
        }
    }

    pub fn character_mut(&mut self, id: &str) -> Option<&mut CharacterRecord> {
        match self.get_mut(id) {
            Some(Snapshot::Character { chr, .. }) => Some(chr),
            _ => None,
        }
    }

    pub fn npc_mut(&mut self, id: &str) -> Option<&mut NpcRecord> {
        match self.get_mut(id) {
            Some(Snapshot::Npc { npc }) => Some(npc),
            _ => None,
        }
    }

    pub fn abilities(&self, character_id: &str) -> Option<&[AbilityRecord]> {
        match self.get(character_id) {
            Some(Snapshot::Character { abilities, .. }) => Some(abilities),
            _ => None,
        }
    }

    pub fn ability_mut(
        &mut self,
        character_id: &str,
        macro_command: &str,
    ) -> Option<&mut AbilityRecord> {
        match self.get_mut(character_id) {
            Some(Snapshot::Character { abilities, .. }) => abilities
                .iter_mut()
                .find(|a| a.macro_command.eq_ignore_ascii_case(macro_command)),
            _ => None,
        }
    }

    pub fn characters(&self) -> impl Iterator<Item = &CharacterRecord> + '_ {
        self.entries.values().filter_map(|e| match &e.snap {
            Snapshot::Character { chr, .. } => Some(chr),
            _ => None,
        })
    }

    pub fn characters_mut(
        &mut self,
    ) -> impl Iterator<Item = (&mut CharacterRecord, &mut Vec<AbilityRecord>)> + '_ {
        self.entries.values_mut().filter_map(|e| match &mut e.snap {
            Snapshot::Character { chr, abilities } => Some((chr, abilities)),
            _ => None,
        })
    }

    /// Case-insensitive exact name match against cached characters.
    /// `token` must already be normalized (lowercased, underscores spaced).
    pub fn characters_by_name(&self, token: &str) -> Vec<&CharacterRecord> {
        self.characters()
            .filter(|c| c.name.to_lowercase() == token)
            .collect()
    }
}
