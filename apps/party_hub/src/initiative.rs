//! Turn order for the party's current encounter.
//!
//! The party actor holds at most one `EncounterLive`; `None` means no
//! encounter is open (both before the first roll and after end/clear).
//! Re-rolling replaces the combatant's previous entry — latest wins.

use crate::model::Id;
use crate::store::InitiativeRow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CombatantId {
    Character(Id),
    Npc(Id),
}

#[derive(Debug, Clone)]
pub struct InitiativeEntry {
    pub combatant: CombatantId,
    pub name: String,
    pub total: i32,
    // Tiebreak chain: roll, then PP, IP, SP, all descending.
    pub pp: i32,
    pub ip: i32,
    pub sp: i32,
    pub silent: bool,
    pub rolled_by_sw: bool,
    pub owner_user_id: Option<Id>,
    pub hidden_npc: bool,
}

impl InitiativeEntry {
    pub fn to_row(&self, encounter_id: &str) -> InitiativeRow {
        let (character_id, npc_id) = match &self.combatant {
            CombatantId::Character(id) => (Some(id.clone()), None),
            CombatantId::Npc(id) => (None, Some(id.clone())),
        };
        InitiativeRow {
            encounter_id: encounter_id.to_string(),
            character_id,
            npc_id,
            display_name: self.name.clone(),
            roll_result: self.total,
            silent: self.silent,
            rolled_by_sw: self.rolled_by_sw,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Viewer<'a> {
    StoryWeaver,
    Player { user_id: Option<&'a str> },
}

#[derive(Debug)]
pub struct EncounterLive {
    pub id: Id,
    pub entries: Vec<InitiativeEntry>,
}

impl EncounterLive {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            entries: Vec::new(),
        }
    }

    pub fn upsert(&mut self, entry: InitiativeEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.combatant == entry.combatant)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn ordered(&self) -> Vec<&InitiativeEntry> {
        let mut v: Vec<&InitiativeEntry> = self.entries.iter().collect();
        v.sort_by_key(|e| (-e.total, -e.pp, -e.ip, -e.sp));
        v
    }

    /// Roster as the given viewer may see it. Players never see silent rolls
    /// they do not own, nor hidden NPCs; the Story Weaver sees everything.
    pub fn visible_entries(&self, viewer: Viewer<'_>) -> Vec<&InitiativeEntry> {
        self.ordered()
            .into_iter()
            .filter(|e| match viewer {
                Viewer::StoryWeaver => true,
                Viewer::Player { user_id } => {
                    if e.hidden_npc {
                        return false;
                    }
                    if e.silent {
                        return match (&e.owner_user_id, user_id) {
                            (Some(owner), Some(uid)) => owner == uid,
                            _ => false,
                        };
                    }
                    true
                }
            })
            .collect()
    }
}
