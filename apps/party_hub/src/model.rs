//! Durable record shapes and the level-derived rule tables.
//!
//! Records carry ids, not references; back-edges (character → party,
//! ability → character) are plain strings resolved through the store.

use serde::{Deserialize, Serialize};

pub type Id = String;

/// DP at or below this puts a character into the Calling.
pub const CALLING_DP: i32 = -10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stat {
    PP,
    IP,
    SP,
}

impl Stat {
    pub fn as_str(self) -> &'static str {
        match self {
            Stat::PP => "PP",
            Stat::IP => "IP",
            Stat::SP => "SP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PP" => Some(Stat::PP),
            "IP" => Some(Stat::IP),
            "SP" => Some(Stat::SP),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharStatus {
    Active,
    Unconscious,
    Dead,
}

impl CharStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CharStatus::Active => "active",
            CharStatus::Unconscious => "unconscious",
            CharStatus::Dead => "dead",
        }
    }
}

/// Status follows DP unless the character is already dead; death is a
/// narrative call, never derived here.
pub fn derive_status(dp: i32, prev: CharStatus) -> CharStatus {
    if prev == CharStatus::Dead {
        return CharStatus::Dead;
    }
    if dp <= 0 {
        CharStatus::Unconscious
    } else {
        CharStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyType {
    Story,
    Ooc,
    Standard,
    Whisper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NpcType {
    Hostile,
    Neutral,
    Ally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbilityType {
    Spell,
    Technique,
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectType {
    Damage,
    Heal,
    Buff,
    Debuff,
    Utility,
}

impl EffectType {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectType::Damage => "damage",
            EffectType::Heal => "heal",
            EffectType::Buff => "buff",
            EffectType::Debuff => "debuff",
            EffectType::Utility => "utility",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyRecord {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub campaign_id: Option<Id>,
    #[serde(default)]
    pub story_weaver_user_id: Option<Id>,
    pub party_type: PartyType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub id: Id,
    pub name: String,
    pub owner_user_id: Id,
    pub party_id: Id,
    pub level: u32,
    pub pp: i32,
    pub ip: i32,
    pub sp: i32,
    pub dp: i32,
    pub max_dp: i32,
    pub edge: i32,
    pub bap: i32,
    pub attack_style: String,
    pub defense_die: String,
    pub status: CharStatus,
    #[serde(default)]
    pub in_calling: bool,
    #[serde(default)]
    pub weapon_bonus: i32,
    #[serde(default)]
    pub armor_bonus: i32,
}

impl CharacterRecord {
    pub fn stat(&self, s: Stat) -> i32 {
        match s {
            Stat::PP => self.pp,
            Stat::IP => self.ip,
            Stat::SP => self.sp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpcRecord {
    pub id: Id,
    pub party_id: Id,
    pub name: String,
    pub level: u32,
    pub pp: i32,
    pub ip: i32,
    pub sp: i32,
    pub dp: i32,
    pub max_dp: i32,
    pub edge: i32,
    pub bap: i32,
    pub attack_style: String,
    pub defense_die: String,
    pub visible_to_players: bool,
    pub npc_type: NpcType,
    pub created_by_user_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbilityRecord {
    pub id: Id,
    pub character_id: Id,
    pub slot: u32,
    pub ability_type: AbilityType,
    pub display_name: String,
    /// Leading slash included, e.g. `/fireball`. Unique per character.
    pub macro_command: String,
    pub power_source: Stat,
    pub effect_type: EffectType,
    pub die: String,
    pub is_aoe: bool,
    pub max_uses: i32,
    pub uses_remaining: i32,
}

// --- Level tables ---------------------------------------------------------

pub fn max_dp_for_level(level: u32) -> i32 {
    (5 * level + 5) as i32
}

pub fn edge_for_level(level: u32) -> i32 {
    (level / 2) as i32
}

pub fn bap_for_level(level: u32) -> i32 {
    ((level + 1) / 2) as i32
}

pub fn attack_styles_for_level(level: u32) -> &'static [&'static str] {
    match level {
        0..=2 => &["1d4"],
        3..=4 => &["2d4", "1d6"],
        5..=6 => &["3d4", "2d6", "1d8"],
        7..=8 => &["4d4", "3d6", "2d8", "1d10"],
        _ => &["5d4", "4d6", "3d8", "2d10", "1d12"],
    }
}

pub fn defense_die_for_level(level: u32) -> &'static str {
    match level {
        0..=2 => "1d4",
        3..=4 => "1d6",
        5..=6 => "1d8",
        7..=8 => "1d10",
        _ => "1d12",
    }
}

/// Core stats are 1..=3 each and always sum to 6.
pub fn validate_stats(pp: i32, ip: i32, sp: i32) -> Result<(), String> {
    for (name, v) in [("PP", pp), ("IP", ip), ("SP", sp)] {
        if !(1..=3).contains(&v) {
            return Err(format!("{name} must be 1-3, got {v}"));
        }
    }
    if pp + ip + sp != 6 {
        return Err(format!("stats must sum to 6, got {}", pp + ip + sp));
    }
    Ok(())
}

pub fn validate_attack_style(level: u32, style: &str) -> Result<(), String> {
    let allowed = attack_styles_for_level(level);
    if allowed.contains(&style) {
        Ok(())
    } else {
        Err(format!(
            "attack style {style} not available at level {level} (allowed: {})",
            allowed.join(", ")
        ))
    }
}
