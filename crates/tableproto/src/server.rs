use serde::{Deserialize, Serialize};

use crate::ChatMode;

/// One attacker die resolved against the shared defense total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackDie {
    pub a: i32,
    pub d: i32,
    pub margin: i32,
    pub damage: i32,
}

/// Per-target outcome inside an ability resolution. `defend_roll` is absent
/// for auto-success effects (heals), `new_dp` for effects that leave DP alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defend_roll: Option<i32>,
    pub amount: i32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_dp: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_rounds: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityResolution {
    pub roll: i32,
    pub effect: String,
    pub per_target: Vec<TargetOutcome>,
}

/// Outbound frames. Everything the hub emits — broadcast or unicast — is one
/// of these, serialized once and fanned out as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Chat {
        actor: String,
        text: String,
        mode: ChatMode,
        party_id: String,
        timestamp: String,
    },
    System {
        text: String,
        party_id: String,
        timestamp: String,
    },
    DiceRoll {
        actor: String,
        dice: String,
        breakdown: Vec<i32>,
        modifier: i32,
        result: i32,
        text: String,
    },
    StatRoll {
        actor: String,
        stat: String,
        dice: String,
        breakdown: Vec<i32>,
        modifier: i32,
        result: i32,
        text: String,
    },
    Initiative {
        actor: String,
        dice: String,
        breakdown: Vec<i32>,
        modifier: i32,
        result: i32,
        text: String,
        silent: bool,
        rolled_by_sw: bool,
        combatant_name: String,
    },
    CombatResult {
        attacker: String,
        defender: String,
        individual_rolls: Vec<AttackDie>,
        total_damage: i32,
        outcome: String,
        defender_new_dp: i32,
        narrative: String,
    },
    AbilityCast {
        caster: String,
        ability: String,
        targets: Vec<String>,
        resolution: AbilityResolution,
        uses_remaining: i32,
    },
    Whisper {
        from: String,
        text: String,
        party_id: String,
        timestamp: String,
    },
    Narration {
        actor: String,
        text: String,
        party_id: String,
        timestamp: String,
    },
    Pong {},
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
