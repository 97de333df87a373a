//! Dice notation and rolling.
//!
//! Notation is `NdS+K` / `NdS-K` (N optional, defaults to 1) or a bare
//! integer. Sides are restricted to the physical set {4, 6, 8, 10, 12}.
//! All rolling goes through a seedable generator so a fixed `WORLD_SEED`
//! reproduces a session exactly.

pub const VALID_SIDES: [u32; 5] = [4, 6, 8, 10, 12];
pub const MAX_DICE: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiceError {
    Malformed(String),
    BadSides(u32),
    BadCount(u32),
    NotDice(String),
}

impl std::fmt::Display for DiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiceError::Malformed(s) => write!(f, "invalid dice notation: {s}"),
            DiceError::BadSides(n) => {
                write!(f, "die size must be one of 4/6/8/10/12, got {n}")
            }
            DiceError::BadCount(n) => write!(f, "number of dice must be 1-{MAX_DICE}, got {n}"),
            DiceError::NotDice(s) => write!(f, "expected a die expression, got {s}"),
        }
    }
}

impl std::error::Error for DiceError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notation {
    Dice { count: u32, sides: u32, modifier: i32 },
    Constant(i32),
}

impl Notation {
    pub fn parse(s: &str) -> Result<Self, DiceError> {
        let t = s.trim().to_ascii_lowercase();
        if t.is_empty() {
            return Err(DiceError::Malformed(s.trim().to_string()));
        }

        if let Ok(v) = t.parse::<i32>() {
            return Ok(Notation::Constant(v));
        }

        let Some(d_pos) = t.find('d') else {
            return Err(DiceError::Malformed(s.trim().to_string()));
        };

        let count_part = &t[..d_pos];
        let count: u32 = if count_part.is_empty() {
            1
        } else {
            count_part
                .parse()
                .map_err(|_| DiceError::Malformed(s.trim().to_string()))?
        };
        if count < 1 || count > MAX_DICE {
            return Err(DiceError::BadCount(count));
        }

        let rest = &t[d_pos + 1..];
        let (sides_part, mod_part) = match rest.find(['+', '-']) {
            Some(i) => (&rest[..i], Some(&rest[i..])),
            None => (rest, None),
        };

        let sides: u32 = sides_part
            .trim()
            .parse()
            .map_err(|_| DiceError::Malformed(s.trim().to_string()))?;
        if !VALID_SIDES.contains(&sides) {
            return Err(DiceError::BadSides(sides));
        }

        let modifier: i32 = match mod_part {
            None => 0,
            Some(m) => {
                let compact: String = m.chars().filter(|c| !c.is_whitespace()).collect();
                compact
                    .parse()
                    .map_err(|_| DiceError::Malformed(s.trim().to_string()))?
            }
        };

        Ok(Notation::Dice {
            count,
            sides,
            modifier,
        })
    }

    /// Same grammar, but bare integers are rejected. Used where a rollable
    /// die is required (attack styles, defense dice, ability dice).
    pub fn parse_die(s: &str) -> Result<Self, DiceError> {
        match Self::parse(s)? {
            n @ Notation::Dice { .. } => Ok(n),
            Notation::Constant(_) => Err(DiceError::NotDice(s.trim().to_string())),
        }
    }

    pub fn display(&self) -> String {
        match *self {
            Notation::Constant(v) => v.to_string(),
            Notation::Dice {
                count,
                sides,
                modifier,
            } => {
                if modifier == 0 {
                    format!("{count}d{sides}")
                } else if modifier > 0 {
                    format!("{count}d{sides}+{modifier}")
                } else {
                    format!("{count}d{sides}{modifier}")
                }
            }
        }
    }

    /// Rebuild the notation with extra flat bonus folded into the modifier.
    pub fn with_bonus(&self, bonus: i32) -> Notation {
        match *self {
            Notation::Constant(v) => Notation::Constant(v + bonus),
            Notation::Dice {
                count,
                sides,
                modifier,
            } => Notation::Dice {
                count,
                sides,
                modifier: modifier + bonus,
            },
        }
    }
}

// xorshift64*, seedable for deterministic sessions.
#[derive(Debug, Clone)]
pub struct Rng64 {
    state: u64,
}

impl Rng64 {
    pub fn from_seed(seed: u64) -> Self {
        let mut s = seed;
        if s == 0 {
            s = 0x9e3779b97f4a7c15;
        }
        Self { state: s }
    }

    pub fn from_entropy() -> Self {
        let mut b = [0u8; 8];
        if getrandom::getrandom(&mut b).is_err() {
            return Self::from_seed(0x2545f4914f6cdd1d);
        }
        Self::from_seed(u64::from_be_bytes(b))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    pub fn roll_range(&mut self, lo: i32, hi_inclusive: i32) -> i32 {
        debug_assert!(lo <= hi_inclusive);
        let span = (hi_inclusive - lo + 1) as u64;
        let v = (self.next_u64() % span) as i32;
        lo + v
    }

    pub fn roll_die(&mut self, sides: u32) -> i32 {
        self.roll_range(1, sides as i32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollResult {
    pub formula: String,
    pub rolls: Vec<i32>,
    pub modifier: i32,
    pub total: i32,
}

impl RollResult {
    /// `"(3 + 1) + 3 = 7"`; single die and bare constants lose the parens.
    pub fn breakdown(&self) -> String {
        let dice_part = match self.rolls.len() {
            0 => self.modifier.to_string(),
            1 => self.rolls[0].to_string(),
            _ => {
                let inner = self
                    .rolls
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(" + ");
                format!("({inner})")
            }
        };
        let mod_part = if self.rolls.is_empty() || self.modifier == 0 {
            String::new()
        } else if self.modifier > 0 {
            format!(" + {}", self.modifier)
        } else {
            format!(" - {}", -self.modifier)
        };
        format!("{dice_part}{mod_part} = {}", self.total)
    }

    /// `"2d6+3 → (3 + 1) + 3 = 7"` for chat display.
    pub fn text(&self) -> String {
        format!("{} \u{2192} {}", self.formula, self.breakdown())
    }
}

pub fn evaluate(rng: &mut Rng64, n: &Notation) -> RollResult {
    match *n {
        Notation::Constant(v) => RollResult {
            formula: n.display(),
            rolls: vec![],
            modifier: v,
            total: v,
        },
        Notation::Dice {
            count,
            sides,
            modifier,
        } => {
            let rolls: Vec<i32> = (0..count).map(|_| rng.roll_die(sides)).collect();
            let total = rolls.iter().sum::<i32>() + modifier;
            RollResult {
                formula: n.display(),
                rolls,
                modifier,
                total,
            }
        }
    }
}

// --- Multi-die attack resolution ------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackOutcome {
    Miss,
    PartialHit,
    FullHit,
}

impl AttackOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttackOutcome::Miss => "miss",
            AttackOutcome::PartialHit => "partial_hit",
            AttackOutcome::FullHit => "full_hit",
        }
    }
}

pub fn classify_outcome(damages: &[i32]) -> AttackOutcome {
    let hits = damages.iter().filter(|&&d| d > 0).count();
    if hits == 0 {
        AttackOutcome::Miss
    } else if hits == damages.len() {
        AttackOutcome::FullHit
    } else {
        AttackOutcome::PartialHit
    }
}

#[derive(Debug, Clone)]
pub struct AttackResolution {
    pub individual: Vec<tableproto::server::AttackDie>,
    pub defense_total: i32,
    pub total_damage: i32,
    pub outcome: AttackOutcome,
}

/// Shared-defense model: the defender rolls once, every attacker die is
/// compared against that total, damage is the sum of positive margins.
#[allow(clippy::too_many_arguments)]
pub fn resolve_multi_die_attack(
    rng: &mut Rng64,
    attack_style: &Notation,
    attacker_stat_value: i32,
    attacker_edge: i32,
    attacker_bap: i32,
    bap_triggered: bool,
    weapon_bonus: i32,
    defense_die: &Notation,
    defender_pp: i32,
    defender_edge: i32,
    armor_bonus: i32,
) -> Result<AttackResolution, DiceError> {
    let Notation::Dice {
        count,
        sides,
        modifier,
    } = *attack_style
    else {
        return Err(DiceError::NotDice(attack_style.display()));
    };

    let defense = evaluate(rng, defense_die);
    let defense_total = defense.total + defender_pp + defender_edge + armor_bonus;

    let bap_bonus = if bap_triggered { attacker_bap } else { 0 };
    let per_die_bonus = attacker_stat_value + attacker_edge + weapon_bonus + bap_bonus + modifier;

    let mut individual = Vec::with_capacity(count as usize);
    let mut total_damage = 0;
    let mut damages = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let a = rng.roll_die(sides) + per_die_bonus;
        let margin = (a - defense_total).max(0);
        individual.push(tableproto::server::AttackDie {
            a,
            d: defense_total,
            margin,
            damage: margin,
        });
        damages.push(margin);
        total_damage += margin;
    }

    Ok(AttackResolution {
        individual,
        defense_total,
        total_damage,
        outcome: classify_outcome(&damages),
    })
}
