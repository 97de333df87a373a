//! Persistence adapter.
//!
//! The hub only sees the [`Store`] trait: reads for characters, NPCs,
//! parties, and abilities; appends for chat/combat/initiative history;
//! narrow updates for DP and ability budgets. [`FileStore`] is the bundled
//! implementation: records hydrate from a JSON fixture at startup and every
//! appended row also lands in an append-only JSON-lines journal.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tableproto::ChatMode;

use crate::model::{
    validate_attack_style, validate_stats, AbilityRecord, CharStatus, CharacterRecord, Id,
    NpcRecord, PartyRecord,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Unavailable(String),
    Invalid(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(s) => write!(f, "store unavailable: {s}"),
            StoreError::Invalid(s) => write!(f, "invalid store operation: {s}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Chat,
    Combat,
    System,
    Narration,
    DiceRoll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub party_id: Id,
    #[serde(default)]
    pub campaign_id: Option<Id>,
    pub sender_id: Id,
    pub sender_name: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub mode: Option<ChatMode>,
    pub content: String,
    #[serde(default)]
    pub extra_data: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatTurnRow {
    pub party_id: Id,
    pub combatant_id: Id,
    pub combatant_name: String,
    pub action_type: String,
    pub result_data: serde_json::Value,
    pub bap_applied: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiativeRow {
    pub encounter_id: Id,
    #[serde(default)]
    pub character_id: Option<Id>,
    #[serde(default)]
    pub npc_id: Option<Id>,
    pub display_name: String,
    pub roll_result: i32,
    pub silent: bool,
    pub rolled_by_sw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncounterRow {
    pub id: Id,
    pub party_id: Id,
    pub active: bool,
    pub started_at: String,
    #[serde(default)]
    pub ended_at: Option<String>,
}

pub trait Store: Send {
    fn load_party(&self, id: &str) -> Result<Option<PartyRecord>, StoreError>;
    fn load_character(&self, id: &str) -> Result<Option<CharacterRecord>, StoreError>;
    fn load_npc(&self, id: &str) -> Result<Option<NpcRecord>, StoreError>;
    fn list_party_characters(&self, party_id: &str) -> Result<Vec<CharacterRecord>, StoreError>;
    fn list_party_npcs(
        &self,
        party_id: &str,
        include_hidden: bool,
    ) -> Result<Vec<NpcRecord>, StoreError>;
    fn list_abilities(&self, character_id: &str) -> Result<Vec<AbilityRecord>, StoreError>;

    fn append_message(&mut self, row: &MessageRow) -> Result<(), StoreError>;
    fn append_combat_turn(&mut self, row: &CombatTurnRow) -> Result<(), StoreError>;

    fn start_encounter(&mut self, party_id: &str) -> Result<Id, StoreError>;
    fn end_encounter(&mut self, id: &str, restore_budgets: bool) -> Result<(), StoreError>;
    fn upsert_initiative_roll(&mut self, row: &InitiativeRow) -> Result<(), StoreError>;
    fn reset_ability_budgets(
        &mut self,
        party_id: &str,
        uses_per_level: i32,
    ) -> Result<(), StoreError>;

    fn update_character_dp(
        &mut self,
        id: &str,
        dp: i32,
        status: CharStatus,
        in_calling: bool,
    ) -> Result<(), StoreError>;
    fn update_npc_dp(&mut self, id: &str, dp: i32) -> Result<(), StoreError>;
    fn update_ability_uses(&mut self, id: &str, uses: i32) -> Result<(), StoreError>;
}

// --- Journal ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
enum JournalEntry {
    Message(MessageRow),
    CombatTurn(CombatTurnRow),
    Initiative(InitiativeRow),
    EncounterStart(EncounterRow),
    EncounterEnd {
        id: Id,
        ended_at: String,
        restore_budgets: bool,
    },
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
}

impl Journal {
    fn append(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| StoreError::Unavailable(format!("encode journal entry: {e}")))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::Unavailable(format!("open {}: {e}", self.path.display())))?;
        f.write_all(line.as_bytes())
            .and_then(|_| f.write_all(b"\n"))
            .and_then(|_| f.flush())
            .map_err(|e| StoreError::Unavailable(format!("write {}: {e}", self.path.display())))
    }
}

// --- Fixture ---------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub parties: Vec<PartyRecord>,
    #[serde(default)]
    pub characters: Vec<CharacterRecord>,
    #[serde(default)]
    pub npcs: Vec<NpcRecord>,
    #[serde(default)]
    pub abilities: Vec<AbilityRecord>,
}

// --- FileStore -------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FileStore {
    parties: HashMap<Id, PartyRecord>,
    characters: HashMap<Id, CharacterRecord>,
    npcs: HashMap<Id, NpcRecord>,
    abilities: HashMap<Id, AbilityRecord>,
    encounters: HashMap<Id, EncounterRow>,
    initiative: HashMap<Id, Vec<InitiativeRow>>,
    messages_seen: HashSet<u64>,
    next_encounter: u64,
    journal: Option<Journal>,
}

fn message_key(row: &MessageRow) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    row.party_id.hash(&mut h);
    row.sender_id.hash(&mut h);
    row.created_at.hash(&mut h);
    row.content.hash(&mut h);
    h.finish()
}

impl FileStore {
    pub fn in_memory() -> Self {
        Self {
            next_encounter: 1,
            ..Default::default()
        }
    }

    /// Open with a journal under `data_dir` and optionally hydrate records
    /// from a fixture file. Existing journal lines are replayed so message
    /// dedup keys and the encounter counter survive a restart.
    pub fn open(data_dir: &Path, fixture: Option<&Path>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        let path = data_dir.join("history.jsonl");

        let mut store = Self::in_memory();
        store.replay(&path)?;
        store.journal = Some(Journal { path });

        if let Some(fx) = fixture {
            let raw = std::fs::read_to_string(fx)
                .with_context(|| format!("read fixture {}", fx.display()))?;
            let fx_data: Fixture = serde_json::from_str(&raw)
                .with_context(|| format!("parse fixture {}", fx.display()))?;
            store.load_fixture(fx_data)?;
        }
        Ok(store)
    }

    pub fn load_fixture(&mut self, fx: Fixture) -> anyhow::Result<()> {
        for c in &fx.characters {
            validate_stats(c.pp, c.ip, c.sp)
                .map_err(|e| anyhow::anyhow!("character {}: {e}", c.name))?;
            validate_attack_style(c.level, &c.attack_style)
                .map_err(|e| anyhow::anyhow!("character {}: {e}", c.name))?;
        }
        for a in &fx.abilities {
            if !a.macro_command.starts_with('/') {
                anyhow::bail!(
                    "ability {}: macro command must start with '/', got {}",
                    a.display_name,
                    a.macro_command
                );
            }
        }
        self.parties.extend(fx.parties.into_iter().map(|p| (p.id.clone(), p)));
        self.characters
            .extend(fx.characters.into_iter().map(|c| (c.id.clone(), c)));
        self.npcs.extend(fx.npcs.into_iter().map(|n| (n.id.clone(), n)));
        self.abilities
            .extend(fx.abilities.into_iter().map(|a| (a.id.clone(), a)));
        Ok(())
    }

    fn replay(&mut self, path: &Path) -> anyhow::Result<()> {
        let f = match std::fs::File::open(path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
        };
        let rd = BufReader::new(f);
        for (lineno, line) in rd.lines().enumerate() {
            let line = line?;
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(raw).with_context(|| {
                format!("journal parse error at {}:{}", path.display(), lineno + 1)
            })?;
            match entry {
                JournalEntry::Message(row) => {
                    self.messages_seen.insert(message_key(&row));
                }
                JournalEntry::EncounterStart(_) => {
                    self.next_encounter += 1;
                }
                JournalEntry::CombatTurn(_)
                | JournalEntry::Initiative(_)
                | JournalEntry::EncounterEnd { .. } => {}
            }
        }
        Ok(())
    }

    fn journal_append(&mut self, entry: JournalEntry) -> Result<(), StoreError> {
        match self.journal.as_mut() {
            Some(j) => j.append(&entry),
            None => Ok(()),
        }
    }

    pub fn initiative_rows(&self, encounter_id: &str) -> &[InitiativeRow] {
        self.initiative
            .get(encounter_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn encounter(&self, id: &str) -> Option<&EncounterRow> {
        self.encounters.get(id)
    }
}

impl Store for FileStore {
    fn load_party(&self, id: &str) -> Result<Option<PartyRecord>, StoreError> {
        Ok(self.parties.get(id).cloned())
    }

    fn load_character(&self, id: &str) -> Result<Option<CharacterRecord>, StoreError> {
        Ok(self.characters.get(id).cloned())
    }

    fn load_npc(&self, id: &str) -> Result<Option<NpcRecord>, StoreError> {
        Ok(self.npcs.get(id).cloned())
    }

    fn list_party_characters(&self, party_id: &str) -> Result<Vec<CharacterRecord>, StoreError> {
        let mut out: Vec<_> = self
            .characters
            .values()
            .filter(|c| c.party_id == party_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn list_party_npcs(
        &self,
        party_id: &str,
        include_hidden: bool,
    ) -> Result<Vec<NpcRecord>, StoreError> {
        let mut out: Vec<_> = self
            .npcs
            .values()
            .filter(|n| n.party_id == party_id && (include_hidden || n.visible_to_players))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn list_abilities(&self, character_id: &str) -> Result<Vec<AbilityRecord>, StoreError> {
        let mut out: Vec<_> = self
            .abilities
            .values()
            .filter(|a| a.character_id == character_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.slot);
        Ok(out)
    }

    fn append_message(&mut self, row: &MessageRow) -> Result<(), StoreError> {
        let key = message_key(row);
        if !self.messages_seen.insert(key) {
            return Ok(());
        }
        if let Err(e) = self.journal_append(JournalEntry::Message(row.clone())) {
            self.messages_seen.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    fn append_combat_turn(&mut self, row: &CombatTurnRow) -> Result<(), StoreError> {
        self.journal_append(JournalEntry::CombatTurn(row.clone()))
    }

    fn start_encounter(&mut self, party_id: &str) -> Result<Id, StoreError> {
        if self
            .encounters
            .values()
            .any(|e| e.party_id == party_id && e.active)
        {
            return Err(StoreError::Invalid(format!(
                "party {party_id} already has an active encounter"
            )));
        }
        let id = format!("enc-{}", self.next_encounter);
        self.next_encounter += 1;
        let row = EncounterRow {
            id: id.clone(),
            party_id: party_id.to_string(),
            active: true,
            started_at: chrono::Utc::now().to_rfc3339(),
            ended_at: None,
        };
        self.journal_append(JournalEntry::EncounterStart(row.clone()))?;
        self.encounters.insert(id.clone(), row);
        Ok(id)
    }

    fn end_encounter(&mut self, id: &str, restore_budgets: bool) -> Result<(), StoreError> {
        let ended_at = chrono::Utc::now().to_rfc3339();
        let Some(e) = self.encounters.get_mut(id) else {
            return Err(StoreError::Invalid(format!("no such encounter {id}")));
        };
        if !e.active {
            return Ok(());
        }
        e.active = false;
        e.ended_at = Some(ended_at.clone());
        self.journal_append(JournalEntry::EncounterEnd {
            id: id.to_string(),
            ended_at,
            restore_budgets,
        })
    }

    fn upsert_initiative_roll(&mut self, row: &InitiativeRow) -> Result<(), StoreError> {
        if row.character_id.is_some() == row.npc_id.is_some() {
            return Err(StoreError::Invalid(
                "initiative roll must reference exactly one of character or npc".to_string(),
            ));
        }
        let rows = self.initiative.entry(row.encounter_id.clone()).or_default();
        if let Some(existing) = rows.iter_mut().find(|r| {
            r.character_id == row.character_id && r.npc_id == row.npc_id
        }) {
            *existing = row.clone();
        } else {
            rows.push(row.clone());
        }
        self.journal_append(JournalEntry::Initiative(row.clone()))
    }

    fn reset_ability_budgets(
        &mut self,
        party_id: &str,
        uses_per_level: i32,
    ) -> Result<(), StoreError> {
        let party_chars: HashSet<&str> = self
            .characters
            .values()
            .filter(|c| c.party_id == party_id)
            .map(|c| c.id.as_str())
            .collect();
        let levels: HashMap<String, u32> = self
            .characters
            .values()
            .filter(|c| c.party_id == party_id)
            .map(|c| (c.id.clone(), c.level))
            .collect();
        for a in self.abilities.values_mut() {
            if party_chars.contains(a.character_id.as_str()) {
                let level = levels.get(&a.character_id).copied().unwrap_or(1);
                a.max_uses = uses_per_level * level as i32;
                a.uses_remaining = a.max_uses;
            }
        }
        Ok(())
    }

    fn update_character_dp(
        &mut self,
        id: &str,
        dp: i32,
        status: CharStatus,
        in_calling: bool,
    ) -> Result<(), StoreError> {
        let Some(c) = self.characters.get_mut(id) else {
            return Err(StoreError::Invalid(format!("no such character {id}")));
        };
        c.dp = dp;
        c.status = status;
        c.in_calling = in_calling;
        Ok(())
    }

    fn update_npc_dp(&mut self, id: &str, dp: i32) -> Result<(), StoreError> {
        let Some(n) = self.npcs.get_mut(id) else {
            return Err(StoreError::Invalid(format!("no such npc {id}")));
        };
        n.dp = dp;
        Ok(())
    }

    fn update_ability_uses(&mut self, id: &str, uses: i32) -> Result<(), StoreError> {
        let Some(a) = self.abilities.get_mut(id) else {
            return Err(StoreError::Invalid(format!("no such ability {id}")));
        };
        a.uses_remaining = uses;
        Ok(())
    }
}
