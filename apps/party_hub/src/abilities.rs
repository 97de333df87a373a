//! Ability cast resolution.
//!
//! Pure given the RNG: validates target shape and budget, rolls the
//! contested (or open) resolution per effect type, and reports DP changes
//! for the caller to apply and write through. Buff/debuff durations are
//! recorded in the broadcast only; round tracking lives with the table.

use tableproto::server::{AbilityResolution, TargetOutcome};

use crate::dice::{evaluate, resolve_multi_die_attack, DiceError, Notation, Rng64};
use crate::mentions::{Target, TargetKind};
use crate::model::{AbilityRecord, CharacterRecord, EffectType, Id};

#[derive(Debug, Clone)]
pub enum CastError {
    Dice(DiceError),
    NoBudget { ability: String },
    NeedsOneTarget { ability: String, got: usize },
    NeedsTargets { ability: String },
}

impl std::fmt::Display for CastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CastError::Dice(e) => write!(f, "{e}"),
            CastError::NoBudget { ability } => {
                write!(f, "No uses of {ability} remain this encounter.")
            }
            CastError::NeedsOneTarget { ability, got } => {
                write!(f, "{ability} takes exactly one @target, got {got}.")
            }
            CastError::NeedsTargets { ability } => {
                write!(f, "{ability} needs at least one @target.")
            }
        }
    }
}

impl std::error::Error for CastError {}

impl From<DiceError> for CastError {
    fn from(e: DiceError) -> Self {
        CastError::Dice(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpChange {
    pub kind: TargetKind,
    pub id: Id,
    pub new_dp: i32,
}

#[derive(Debug)]
pub struct CastOutcome {
    pub resolution: AbilityResolution,
    pub dp_changes: Vec<DpChange>,
}

fn target_combat_block(t: &Target) -> (Notation, i32, i32, i32, i32, i32) {
    // (defense_die, pp, edge, armor_bonus, dp, max_dp)
    match t {
        Target::Character(c) => (
            Notation::parse_die(&c.defense_die).unwrap_or(Notation::Dice {
                count: 1,
                sides: 6,
                modifier: 0,
            }),
            c.pp,
            c.edge,
            c.armor_bonus,
            c.dp,
            c.max_dp,
        ),
        Target::Npc(n) => (
            Notation::parse_die(&n.defense_die).unwrap_or(Notation::Dice {
                count: 1,
                sides: 6,
                modifier: 0,
            }),
            n.pp,
            n.edge,
            0,
            n.dp,
            n.max_dp,
        ),
    }
}

fn kind_of(t: &Target) -> TargetKind {
    match t {
        Target::Character(_) => TargetKind::Character,
        Target::Npc(_) => TargetKind::Npc,
    }
}

pub fn resolve_cast(
    rng: &mut Rng64,
    ability: &AbilityRecord,
    caster: &CharacterRecord,
    targets: &[Target],
    bap_triggered: bool,
) -> Result<CastOutcome, CastError> {
    if ability.uses_remaining <= 0 {
        return Err(CastError::NoBudget {
            ability: ability.display_name.clone(),
        });
    }

    let needs_target = !matches!(ability.effect_type, EffectType::Utility);
    if needs_target {
        if ability.is_aoe {
            if targets.is_empty() {
                return Err(CastError::NeedsTargets {
                    ability: ability.display_name.clone(),
                });
            }
        } else if targets.len() != 1 {
            return Err(CastError::NeedsOneTarget {
                ability: ability.display_name.clone(),
                got: targets.len(),
            });
        }
    }

    let die = Notation::parse_die(&ability.die)?;
    let stat_value = caster.stat(ability.power_source);
    let bap_bonus = if bap_triggered { caster.bap } else { 0 };

    let mut per_target = Vec::with_capacity(targets.len());
    let mut dp_changes = Vec::new();
    let mut headline_roll = 0;

    match ability.effect_type {
        EffectType::Damage => {
            // Margin-per-die against each target's own defense roll.
            for t in targets {
                let (def_die, pp, edge, armor, dp, _max) = target_combat_block(t);
                let res = resolve_multi_die_attack(
                    rng,
                    &die,
                    stat_value,
                    caster.edge,
                    caster.bap,
                    bap_triggered,
                    0,
                    &def_die,
                    pp,
                    edge,
                    armor,
                )?;
                let new_dp = dp - res.total_damage;
                headline_roll += res.total_damage;
                per_target.push(TargetOutcome {
                    target: t.name().to_string(),
                    defend_roll: Some(res.defense_total),
                    amount: res.total_damage,
                    success: res.total_damage > 0,
                    new_dp: Some(new_dp),
                    duration_rounds: None,
                });
                dp_changes.push(DpChange {
                    kind: kind_of(t),
                    id: t.id().to_string(),
                    new_dp,
                });
            }
        }
        EffectType::Heal => {
            // Auto-success; one roll per target, capped at max DP.
            for t in targets {
                let (_, _, _, _, dp, max_dp) = target_combat_block(t);
                let roll = evaluate(rng, &die);
                let amount = roll.total + stat_value + caster.edge + bap_bonus;
                let new_dp = (dp + amount.max(0)).min(max_dp);
                headline_roll = amount;
                per_target.push(TargetOutcome {
                    target: t.name().to_string(),
                    defend_roll: None,
                    amount,
                    success: true,
                    new_dp: Some(new_dp),
                    duration_rounds: None,
                });
                dp_changes.push(DpChange {
                    kind: kind_of(t),
                    id: t.id().to_string(),
                    new_dp,
                });
            }
        }
        EffectType::Buff | EffectType::Debuff => {
            let roll = evaluate(rng, &die);
            let caster_total = roll.total + stat_value + caster.edge + bap_bonus;
            headline_roll = caster_total;
            for t in targets {
                let (def_die, pp, edge, armor, _dp, _max) = target_combat_block(t);
                let defend = evaluate(rng, &def_die).total + pp + edge + armor;
                let margin = caster_total - defend;
                let success = margin > 0;
                per_target.push(TargetOutcome {
                    target: t.name().to_string(),
                    defend_roll: Some(defend),
                    amount: margin.max(0),
                    success,
                    new_dp: None,
                    duration_rounds: success.then(|| margin.clamp(1, 6)),
                });
            }
        }
        EffectType::Utility => {
            let roll = evaluate(rng, &die);
            let caster_total = roll.total + stat_value + caster.edge + bap_bonus;
            headline_roll = caster_total;
            if targets.is_empty() {
                // Open roll: no opposition, outcome is the number itself.
                per_target.push(TargetOutcome {
                    target: caster.name.clone(),
                    defend_roll: None,
                    amount: caster_total,
                    success: true,
                    new_dp: None,
                    duration_rounds: None,
                });
            } else {
                for t in targets {
                    let (def_die, pp, edge, armor, _dp, _max) = target_combat_block(t);
                    let defend = evaluate(rng, &def_die).total + pp + edge + armor;
                    per_target.push(TargetOutcome {
                        target: t.name().to_string(),
                        defend_roll: Some(defend),
                        amount: caster_total,
                        success: caster_total > defend,
                        new_dp: None,
                        duration_rounds: None,
                    });
                }
            }
        }
    }

    Ok(CastOutcome {
        resolution: AbilityResolution {
            roll: headline_roll,
            effect: ability.effect_type.as_str().to_string(),
            per_target,
        },
        dp_changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AbilityType, CharStatus, NpcRecord, NpcType, Stat};

    fn caster() -> CharacterRecord {
        CharacterRecord {
            id: "c1".into(),
            name: "Alice".into(),
            owner_user_id: "u1".into(),
            party_id: "p1".into(),
            level: 5,
            pp: 1,
            ip: 3,
            sp: 2,
            dp: 20,
            max_dp: 30,
            edge: 2,
            bap: 3,
            attack_style: "3d4".into(),
            defense_die: "1d8".into(),
            status: CharStatus::Active,
            in_calling: false,
            weapon_bonus: 0,
            armor_bonus: 0,
        }
    }

    fn ability(effect: EffectType, aoe: bool, uses: i32) -> AbilityRecord {
        AbilityRecord {
            id: "a1".into(),
            character_id: "c1".into(),
            slot: 1,
            ability_type: AbilityType::Spell,
            display_name: "Fireball".into(),
            macro_command: "/fireball".into(),
            power_source: Stat::IP,
            effect_type: effect,
            die: "2d6".into(),
            is_aoe: aoe,
            max_uses: 15,
            uses_remaining: uses,
        }
    }

    fn goblin(dp: i32) -> Target {
        Target::Npc(NpcRecord {
            id: "n1".into(),
            party_id: "p1".into(),
            name: "Goblin".into(),
            level: 3,
            pp: 2,
            ip: 2,
            sp: 2,
            dp,
            max_dp: 20,
            edge: 1,
            bap: 2,
            attack_style: "2d4".into(),
            defense_die: "1d8".into(),
            visible_to_players: true,
            npc_type: NpcType::Hostile,
            created_by_user_id: "sw".into(),
        })
    }

    #[test]
    fn exhausted_budget_refuses_the_cast() {
        let mut rng = Rng64::from_seed(1);
        let err = resolve_cast(
            &mut rng,
            &ability(EffectType::Damage, false, 0),
            &caster(),
            &[goblin(10)],
            false,
        );
        assert!(matches!(err, Err(CastError::NoBudget { .. })));
    }

    #[test]
    fn single_target_ability_rejects_extra_targets() {
        let mut rng = Rng64::from_seed(1);
        let err = resolve_cast(
            &mut rng,
            &ability(EffectType::Damage, false, 3),
            &caster(),
            &[goblin(10), goblin(10)],
            false,
        );
        assert!(matches!(err, Err(CastError::NeedsOneTarget { got: 2, .. })));
    }

    #[test]
    fn aoe_ability_needs_at_least_one_target() {
        let mut rng = Rng64::from_seed(1);
        let err = resolve_cast(
            &mut rng,
            &ability(EffectType::Damage, true, 3),
            &caster(),
            &[],
            false,
        );
        assert!(matches!(err, Err(CastError::NeedsTargets { .. })));
    }

    #[test]
    fn damage_reports_a_dp_change_per_target() {
        let mut rng = Rng64::from_seed(17);
        let out = resolve_cast(
            &mut rng,
            &ability(EffectType::Damage, true, 3),
            &caster(),
            &[goblin(10), goblin(10)],
            false,
        )
        .unwrap();
        assert_eq!(out.dp_changes.len(), 2);
        for (outcome, change) in out.resolution.per_target.iter().zip(&out.dp_changes) {
            assert_eq!(change.new_dp, 10 - outcome.amount);
            assert_eq!(outcome.new_dp, Some(change.new_dp));
        }
    }

    #[test]
    fn heal_is_auto_success_and_caps_at_max_dp() {
        let mut rng = Rng64::from_seed(3);
        for _ in 0..50 {
            let out = resolve_cast(
                &mut rng,
                &ability(EffectType::Heal, false, 3),
                &caster(),
                &[goblin(19)],
                false,
            )
            .unwrap();
            let t = &out.resolution.per_target[0];
            assert!(t.success);
            assert!(t.defend_roll.is_none());
            assert_eq!(out.dp_changes[0].new_dp, 20, "heal must cap at max DP");
        }
    }

    #[test]
    fn buff_duration_comes_from_the_margin_clamped_to_six() {
        let mut rng = Rng64::from_seed(11);
        for _ in 0..100 {
            let out = resolve_cast(
                &mut rng,
                &ability(EffectType::Buff, false, 3),
                &caster(),
                &[goblin(10)],
                false,
            )
            .unwrap();
            let t = &out.resolution.per_target[0];
            match t.duration_rounds {
                Some(d) => {
                    assert!(t.success);
                    assert!((1..=6).contains(&d));
                }
                None => assert!(!t.success),
            }
            assert!(out.dp_changes.is_empty());
        }
    }

    #[test]
    fn utility_with_no_targets_is_an_open_roll() {
        let mut rng = Rng64::from_seed(5);
        let out = resolve_cast(
            &mut rng,
            &ability(EffectType::Utility, false, 3),
            &caster(),
            &[],
            false,
        )
        .unwrap();
        assert_eq!(out.resolution.per_target.len(), 1);
        assert!(out.resolution.per_target[0].success);
        assert!(out.dp_changes.is_empty());
    }

    #[test]
    fn bap_raises_the_heal_amount() {
        let mut a = Rng64::from_seed(9);
        let mut b = Rng64::from_seed(9);
        let plain = resolve_cast(
            &mut a,
            &ability(EffectType::Heal, false, 3),
            &caster(),
            &[goblin(1)],
            false,
        )
        .unwrap();
        let boosted = resolve_cast(
            &mut b,
            &ability(EffectType::Heal, false, 3),
            &caster(),
            &[goblin(1)],
            true,
        )
        .unwrap();
        assert_eq!(
            boosted.resolution.per_target[0].amount,
            plain.resolution.per_target[0].amount + 3
        );
    }
}
