//! Slash-command dispatch.
//!
//! Two command tiers: the closed builtin set below, then the sender's own
//! ability macros looked up by `macro_command`. Every handler returns
//! `Result<Dispatch, CmdError>`; errors become private system replies and
//! never reach the socket loop. Store write-throughs happen before the
//! broadcast is handed back, so a failed write never fans out.

use std::collections::HashMap;

use tableproto::now_ts;
use tableproto::server::ServerFrame;
use tracing::warn;

use crate::abilities::{resolve_cast, CastError, DpChange};
use crate::cache::StatsCache;
use crate::dice::{evaluate, resolve_multi_die_attack, AttackOutcome, Notation, Rng64};
use crate::initiative::{CombatantId, EncounterLive, InitiativeEntry, Viewer};
use crate::mentions::{self, MentionError, Target, TargetKind};
use crate::model::{
    derive_status, AbilityRecord, CharStatus, CharacterRecord, Id, PartyRecord, Stat, CALLING_DP,
};
use crate::store::{CombatTurnRow, MessageRow, MessageType, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogVerbosity {
    Macros,
    Minimal,
    Off,
}

impl LogVerbosity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "macros" => Some(LogVerbosity::Macros),
            "minimal" => Some(LogVerbosity::Minimal),
            "off" => Some(LogVerbosity::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityPolicy {
    Reject,
    Ignore,
}

impl VisibilityPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(VisibilityPolicy::Reject),
            "ignore" => Some(VisibilityPolicy::Ignore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub throttle_ms: u64,
    pub verbosity: LogVerbosity,
    pub visibility: VisibilityPolicy,
    pub uses_per_level: i32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 700,
            verbosity: LogVerbosity::Macros,
            visibility: VisibilityPolicy::Reject,
            uses_per_level: 3,
        }
    }
}

/// The acting connection, as the hub knows it.
#[derive(Debug, Clone)]
pub struct Sender {
    pub display: String,
    pub user_id: Option<Id>,
    pub character_id: Option<Id>,
    pub is_sw: bool,
}

/// A connected socket, for `/who` and whisper routing.
#[derive(Debug, Clone)]
pub struct OnlineEntry {
    pub display: String,
    pub character_id: Option<Id>,
    pub is_sw: bool,
}

/// Who a broadcast goes to. Silent initiative rolls stay between the Story
/// Weaver and the combatant's own sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    SwOnly { also_character: Option<Id> },
}

#[derive(Debug, Default)]
pub struct Dispatch {
    pub broadcast: Option<(ServerFrame, Audience)>,
    pub private: Option<ServerFrame>,
}

impl Dispatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn broadcast(frame: ServerFrame) -> Self {
        Self {
            broadcast: Some((frame, Audience::All)),
            private: None,
        }
    }

    pub fn broadcast_to(frame: ServerFrame, audience: Audience) -> Self {
        Self {
            broadcast: Some((frame, audience)),
            private: None,
        }
    }

    pub fn private(frame: ServerFrame) -> Self {
        Self {
            broadcast: None,
            private: Some(frame),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CmdError {
    Input(String),
    Usage(String),
    Mention(String),
    Permission(String),
    Budget(String),
    State(String),
    Store { corr: String },
    Internal { corr: String },
}

impl CmdError {
    pub fn user_text(&self) -> String {
        match self {
            CmdError::Input(s)
            | CmdError::Usage(s)
            | CmdError::Mention(s)
            | CmdError::Permission(s)
            | CmdError::Budget(s)
            | CmdError::State(s) => s.clone(),
            CmdError::Store { corr } => {
                format!("Could not save that. Try again shortly. (ref {corr})")
            }
            CmdError::Internal { corr } => {
                format!("Something went wrong on our side. (ref {corr})")
            }
        }
    }
}

fn corr_id() -> String {
    let mut b = [0u8; 4];
    let _ = getrandom::getrandom(&mut b);
    b.iter().map(|x| format!("{x:02x}")).collect()
}

fn store_failure(op: &str, e: StoreError) -> CmdError {
    let corr = corr_id();
    warn!(op, err = %e, corr = %corr, "store write-through failed");
    CmdError::Store { corr }
}

fn internal_failure(what: &str, detail: &str) -> CmdError {
    let corr = corr_id();
    warn!(what, detail, corr = %corr, "internal handler failure");
    CmdError::Internal { corr }
}

impl From<MentionError> for CmdError {
    fn from(e: MentionError) -> Self {
        match e {
            MentionError::Store(err) => store_failure("mention lookup", err),
            other => CmdError::Mention(other.to_string()),
        }
    }
}

impl From<CastError> for CmdError {
    fn from(e: CastError) -> Self {
        match e {
            CastError::NoBudget { .. } => CmdError::Budget(e.to_string()),
            CastError::NeedsOneTarget { .. } | CastError::NeedsTargets { .. } => {
                CmdError::Usage(e.to_string())
            }
            CastError::Dice(d) => CmdError::Usage(d.to_string()),
        }
    }
}

/// Everything a macro handler may read or mutate, borrowed from the party
/// actor for the duration of one command.
pub struct MacroCtx<'a> {
    pub party: &'a PartyRecord,
    pub cache: &'a mut StatsCache,
    pub encounter: &'a mut Option<EncounterLive>,
    pub store: &'a mut dyn Store,
    pub rng: &'a mut Rng64,
    pub cfg: &'a HubConfig,
    pub now_ms: u64,
    pub throttle: &'a mut HashMap<String, u64>,
    pub online: &'a [OnlineEntry],
}

impl MacroCtx<'_> {
    fn system(&self, text: impl Into<String>) -> ServerFrame {
        ServerFrame::System {
            text: text.into(),
            party_id: self.party.id.clone(),
            timestamp: now_ts(),
        }
    }
}

pub fn dispatch(ctx: &mut MacroCtx, sender: &Sender, text: &str) -> Dispatch {
    let key = sender.display.to_lowercase();
    if let Some(&last) = ctx.throttle.get(&key) {
        if ctx.now_ms.saturating_sub(last) < ctx.cfg.throttle_ms {
            return Dispatch::private(ctx.system(format!(
                "Slow down: one macro every {}ms.",
                ctx.cfg.throttle_ms
            )));
        }
    }
    ctx.throttle.insert(key, ctx.now_ms);

    match run_command(ctx, sender, text) {
        Ok(d) => d,
        Err(e) => Dispatch::private(ctx.system(e.user_text())),
    }
}

fn run_command(ctx: &mut MacroCtx, sender: &Sender, text: &str) -> Result<Dispatch, CmdError> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim().to_string();
    let cmd_lc = cmd.to_lowercase();

    match cmd_lc.as_str() {
        "/roll" => handle_roll(ctx, sender, &rest),
        "/pp" => handle_stat(ctx, sender, Stat::PP),
        "/ip" => handle_stat(ctx, sender, Stat::IP),
        "/sp" => handle_stat(ctx, sender, Stat::SP),
        "/defend" => handle_defend(ctx, sender),
        "/attack" => handle_attack(ctx, sender, &rest),
        "/initiative" => handle_initiative(ctx, sender, &rest),
        "/who" => handle_who(ctx, sender),
        _ => handle_ability(ctx, sender, &cmd_lc, &rest),
    }
}

// --- Persistence helpers ---------------------------------------------------

fn verbosity_allows(v: LogVerbosity, frame: &ServerFrame) -> bool {
    match v {
        LogVerbosity::Off => false,
        LogVerbosity::Macros => true,
        LogVerbosity::Minimal => matches!(
            frame,
            ServerFrame::DiceRoll { .. } | ServerFrame::Initiative { .. }
        ),
    }
}

fn frame_row_shape(frame: &ServerFrame) -> Option<(MessageType, String)> {
    match frame {
        ServerFrame::DiceRoll { text, .. } => Some((MessageType::DiceRoll, text.clone())),
        ServerFrame::StatRoll { text, .. } => Some((MessageType::DiceRoll, text.clone())),
        ServerFrame::Initiative { text, .. } => Some((MessageType::DiceRoll, text.clone())),
        ServerFrame::CombatResult { narrative, .. } => {
            Some((MessageType::Combat, narrative.clone()))
        }
        ServerFrame::AbilityCast {
            caster, ability, ..
        } => Some((MessageType::Combat, format!("{caster} casts {ability}"))),
        ServerFrame::System { text, .. } => Some((MessageType::System, text.clone())),
        _ => None,
    }
}

fn persist_frame(ctx: &mut MacroCtx, sender: &Sender, frame: &ServerFrame) -> Result<(), CmdError> {
    if !verbosity_allows(ctx.cfg.verbosity, frame) {
        return Ok(());
    }
    let Some((message_type, content)) = frame_row_shape(frame) else {
        return Ok(());
    };
    let row = MessageRow {
        party_id: ctx.party.id.clone(),
        campaign_id: ctx.party.campaign_id.clone(),
        sender_id: sender
            .character_id
            .clone()
            .unwrap_or_else(|| format!("user:{}", sender.display.to_lowercase())),
        sender_name: sender.display.clone(),
        message_type,
        mode: None,
        content,
        extra_data: serde_json::to_value(frame).ok(),
        created_at: now_ts(),
    };
    ctx.store
        .append_message(&row)
        .map_err(|e| store_failure("append_message", e))
}

fn append_combat_turn(
    ctx: &mut MacroCtx,
    combatant_id: &str,
    combatant_name: &str,
    action_type: &str,
    frame: &ServerFrame,
    bap_applied: bool,
) -> Result<(), CmdError> {
    let row = CombatTurnRow {
        party_id: ctx.party.id.clone(),
        combatant_id: combatant_id.to_string(),
        combatant_name: combatant_name.to_string(),
        action_type: action_type.to_string(),
        result_data: serde_json::to_value(frame).unwrap_or(serde_json::Value::Null),
        bap_applied,
        created_at: now_ts(),
    };
    ctx.store
        .append_combat_turn(&row)
        .map_err(|e| store_failure("append_combat_turn", e))
}

// --- DP write-through with revert ------------------------------------------

struct DpPrev {
    kind: TargetKind,
    id: Id,
    dp: i32,
    status: CharStatus,
    in_calling: bool,
}

fn apply_dp_change(ctx: &mut MacroCtx, change: &DpChange) -> Result<DpPrev, CmdError> {
    match change.kind {
        TargetKind::Character => {
            if let Some(c) = ctx.cache.character_mut(&change.id) {
                let prev = DpPrev {
                    kind: TargetKind::Character,
                    id: change.id.clone(),
                    dp: c.dp,
                    status: c.status,
                    in_calling: c.in_calling,
                };
                c.dp = change.new_dp;
                c.status = derive_status(change.new_dp, prev.status);
                c.in_calling = prev.in_calling || change.new_dp <= CALLING_DP;
                let (status, in_calling) = (c.status, c.in_calling);
                if let Err(e) =
                    ctx.store
                        .update_character_dp(&change.id, change.new_dp, status, in_calling)
                {
                    if let Some(c) = ctx.cache.character_mut(&change.id) {
                        c.dp = prev.dp;
                        c.status = prev.status;
                        c.in_calling = prev.in_calling;
                    }
                    return Err(store_failure("update_character_dp", e));
                }
                Ok(prev)
            } else {
                let rec = ctx
                    .store
                    .load_character(&change.id)
                    .map_err(|e| store_failure("load_character", e))?
                    .ok_or_else(|| internal_failure("dp change", "character vanished"))?;
                let prev = DpPrev {
                    kind: TargetKind::Character,
                    id: change.id.clone(),
                    dp: rec.dp,
                    status: rec.status,
                    in_calling: rec.in_calling,
                };
                let status = derive_status(change.new_dp, rec.status);
                let in_calling = rec.in_calling || change.new_dp <= CALLING_DP;
                ctx.store
                    .update_character_dp(&change.id, change.new_dp, status, in_calling)
                    .map_err(|e| store_failure("update_character_dp", e))?;
                Ok(prev)
            }
        }
        TargetKind::Npc => {
            let prev_dp = if let Some(n) = ctx.cache.npc_mut(&change.id) {
                let prev = n.dp;
                n.dp = change.new_dp;
                prev
            } else {
                ctx.store
                    .load_npc(&change.id)
                    .map_err(|e| store_failure("load_npc", e))?
                    .ok_or_else(|| internal_failure("dp change", "npc vanished"))?
                    .dp
            };
            if let Err(e) = ctx.store.update_npc_dp(&change.id, change.new_dp) {
                if let Some(n) = ctx.cache.npc_mut(&change.id) {
                    n.dp = prev_dp;
                }
                return Err(store_failure("update_npc_dp", e));
            }
            Ok(DpPrev {
                kind: TargetKind::Npc,
                id: change.id.clone(),
                dp: prev_dp,
                status: CharStatus::Active,
                in_calling: false,
            })
        }
    }
}

fn revert_dp(ctx: &mut MacroCtx, prev: &DpPrev) {
    match prev.kind {
        TargetKind::Character => {
            if let Some(c) = ctx.cache.character_mut(&prev.id) {
                c.dp = prev.dp;
                c.status = prev.status;
                c.in_calling = prev.in_calling;
            }
            let _ = ctx
                .store
                .update_character_dp(&prev.id, prev.dp, prev.status, prev.in_calling);
        }
        TargetKind::Npc => {
            if let Some(n) = ctx.cache.npc_mut(&prev.id) {
                n.dp = prev.dp;
            }
            let _ = ctx.store.update_npc_dp(&prev.id, prev.dp);
        }
    }
}

// --- Shared lookups --------------------------------------------------------

fn bound_character(ctx: &MacroCtx, sender: &Sender) -> Result<CharacterRecord, CmdError> {
    sender
        .character_id
        .as_deref()
        .and_then(|id| ctx.cache.character(id))
        .cloned()
        .ok_or_else(|| CmdError::Usage("This command needs a bound character.".to_string()))
}

/// SW gate. `Ok(false)` means "swallow silently" under the ignore policy.
fn sw_only(ctx: &MacroCtx, sender: &Sender, what: &str) -> Result<bool, CmdError> {
    if sender.is_sw {
        return Ok(true);
    }
    match ctx.cfg.visibility {
        VisibilityPolicy::Reject => Err(CmdError::Permission(format!(
            "Only the Story Weaver can {what}."
        ))),
        VisibilityPolicy::Ignore => Ok(false),
    }
}

fn target_defense(t: &Target) -> Result<(Notation, i32, i32, i32, i32), CmdError> {
    // (defense_die, pp, edge, armor_bonus, dp)
    match t {
        Target::Character(c) => Ok((
            Notation::parse_die(&c.defense_die)
                .map_err(|e| internal_failure("defense die", &e.to_string()))?,
            c.pp,
            c.edge,
            c.armor_bonus,
            c.dp,
        )),
        Target::Npc(n) => Ok((
            Notation::parse_die(&n.defense_die)
                .map_err(|e| internal_failure("defense die", &e.to_string()))?,
            n.pp,
            n.edge,
            0,
            n.dp,
        )),
    }
}

// --- Handlers --------------------------------------------------------------

fn handle_roll(ctx: &mut MacroCtx, sender: &Sender, rest: &str) -> Result<Dispatch, CmdError> {
    if rest.is_empty() {
        return Err(CmdError::Usage(
            "Usage: /roll <notation>, e.g. /roll 2d6+3".to_string(),
        ));
    }
    let n = Notation::parse(rest).map_err(|e| CmdError::Usage(e.to_string()))?;
    let r = evaluate(ctx.rng, &n);
    let frame = ServerFrame::DiceRoll {
        actor: sender.display.clone(),
        dice: r.formula.clone(),
        breakdown: r.rolls.clone(),
        modifier: r.modifier,
        result: r.total,
        text: r.text(),
    };
    persist_frame(ctx, sender, &frame)?;
    Ok(Dispatch::broadcast(frame))
}

fn handle_stat(ctx: &mut MacroCtx, sender: &Sender, stat: Stat) -> Result<Dispatch, CmdError> {
    // Unbound senders still get a roll, with placeholder stat 0 / edge 1.
    let (stat_value, edge) = sender
        .character_id
        .as_deref()
        .and_then(|id| ctx.cache.character(id))
        .map(|c| (c.stat(stat), c.edge))
        .unwrap_or((0, 1));

    let n = Notation::Dice {
        count: 1,
        sides: 6,
        modifier: stat_value + edge,
    };
    let r = evaluate(ctx.rng, &n);
    let frame = ServerFrame::StatRoll {
        actor: sender.display.clone(),
        stat: stat.as_str().to_string(),
        dice: r.formula.clone(),
        breakdown: r.rolls.clone(),
        modifier: r.modifier,
        result: r.total,
        text: format!("{} check: {}", stat.as_str(), r.text()),
    };
    persist_frame(ctx, sender, &frame)?;
    Ok(Dispatch::broadcast(frame))
}

fn handle_defend(ctx: &mut MacroCtx, sender: &Sender) -> Result<Dispatch, CmdError> {
    let chr = bound_character(ctx, sender)?;
    let die = Notation::parse_die(&chr.defense_die)
        .map_err(|e| internal_failure("defense die", &e.to_string()))?;
    let n = die.with_bonus(chr.pp + chr.edge + chr.armor_bonus);
    let r = evaluate(ctx.rng, &n);
    let frame = ServerFrame::StatRoll {
        actor: sender.display.clone(),
        stat: "DEF".to_string(),
        dice: r.formula.clone(),
        breakdown: r.rolls.clone(),
        modifier: r.modifier,
        result: r.total,
        text: format!("{} defends: {}", chr.name, r.text()),
    };
    persist_frame(ctx, sender, &frame)?;
    Ok(Dispatch::broadcast(frame))
}

fn narrative_for(outcome: AttackOutcome, attacker: &str, defender: &str) -> String {
    match outcome {
        AttackOutcome::Miss => format!("{defender} turns every blow aside."),
        AttackOutcome::PartialHit => format!("{attacker} lands a glancing hit on {defender}."),
        AttackOutcome::FullHit => format!("{attacker} strikes {defender} true."),
    }
}

fn handle_attack(ctx: &mut MacroCtx, sender: &Sender, rest: &str) -> Result<Dispatch, CmdError> {
    let attacker = bound_character(ctx, sender)?;
    let target = match mentions::resolve_single(
        rest,
        &ctx.party.id,
        sender.is_sw,
        ctx.cache,
        &*ctx.store,
        None,
    ) {
        Ok(t) => t,
        Err(MentionError::NoTarget) => {
            return Err(CmdError::Usage("Usage: /attack @target".to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    let style = Notation::parse_die(&attacker.attack_style)
        .map_err(|e| internal_failure("attack style", &e.to_string()))?;
    let (def_die, def_pp, def_edge, def_armor, def_dp) = target_defense(&target)?;

    let res = resolve_multi_die_attack(
        ctx.rng,
        &style,
        attacker.pp,
        attacker.edge,
        attacker.bap,
        false,
        attacker.weapon_bonus,
        &def_die,
        def_pp,
        def_edge,
        def_armor,
    )
    .map_err(|e| internal_failure("attack resolution", &e.to_string()))?;

    let new_dp = def_dp - res.total_damage;
    let frame = ServerFrame::CombatResult {
        attacker: attacker.name.clone(),
        defender: target.name().to_string(),
        individual_rolls: res.individual.clone(),
        total_damage: res.total_damage,
        outcome: res.outcome.as_str().to_string(),
        defender_new_dp: new_dp,
        narrative: narrative_for(res.outcome, &attacker.name, target.name()),
    };

    append_combat_turn(ctx, &attacker.id, &attacker.name, "attack", &frame, false)?;
    persist_frame(ctx, sender, &frame)?;

    let kind = match &target {
        Target::Character(_) => TargetKind::Character,
        Target::Npc(_) => TargetKind::Npc,
    };
    apply_dp_change(
        ctx,
        &DpChange {
            kind,
            id: target.id().to_string(),
            new_dp,
        },
    )?;

    Ok(Dispatch::broadcast(frame))
}

fn handle_who(ctx: &mut MacroCtx, sender: &Sender) -> Result<Dispatch, CmdError> {
    let mut online_names: Vec<String> = Vec::new();
    for e in ctx.online {
        let tag = if e.is_sw { " (SW)" } else { "" };
        online_names.push(format!("{}{tag}", e.display));
    }
    online_names.sort();

    let online_char_ids: Vec<&str> = ctx
        .online
        .iter()
        .filter_map(|e| e.character_id.as_deref())
        .collect();
    let offline: Vec<String> = ctx
        .store
        .list_party_characters(&ctx.party.id)
        .map_err(|e| store_failure("list_party_characters", e))?
        .into_iter()
        .filter(|c| !online_char_ids.contains(&c.id.as_str()))
        .map(|c| c.name)
        .collect();

    let npcs: Vec<String> = ctx
        .store
        .list_party_npcs(&ctx.party.id, sender.is_sw)
        .map_err(|e| store_failure("list_party_npcs", e))?
        .into_iter()
        .map(|n| {
            if n.visible_to_players {
                n.name
            } else {
                format!("{} (hidden)", n.name)
            }
        })
        .collect();

    let mut text = String::new();
    text.push_str(&format!("online: {}\n", join_or_none(&online_names)));
    text.push_str(&format!("offline: {}\n", join_or_none(&offline)));
    text.push_str(&format!("npcs: {}", join_or_none(&npcs)));
    Ok(Dispatch::private(ctx.system(text)))
}

fn join_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "nobody".to_string()
    } else {
        names.join(", ")
    }
}

fn handle_initiative(ctx: &mut MacroCtx, sender: &Sender, rest: &str) -> Result<Dispatch, CmdError> {
    let rest_lc = rest.to_lowercase();
    match rest_lc.as_str() {
        "" => initiative_self(ctx, sender),
        "show" => initiative_show(ctx, sender),
        "end" => initiative_end(ctx, sender, true),
        "clear" => initiative_end(ctx, sender, false),
        _ => {
            if let Some(target_text) = rest_lc.strip_prefix("silent") {
                let target_text = target_text.trim();
                if !target_text.starts_with('@') {
                    return Err(CmdError::Usage(
                        "Usage: /initiative silent @target".to_string(),
                    ));
                }
                initiative_for_target(ctx, sender, target_text, true)
            } else if rest.trim_start().starts_with('@') {
                initiative_for_target(ctx, sender, rest, false)
            } else {
                Err(CmdError::Usage(
                    "Usage: /initiative [@target | silent @target | show | end | clear]"
                        .to_string(),
                ))
            }
        }
    }
}

fn ensure_encounter(ctx: &mut MacroCtx) -> Result<(), CmdError> {
    if ctx.encounter.is_some() {
        return Ok(());
    }
    let id = ctx
        .store
        .start_encounter(&ctx.party.id)
        .map_err(|e| store_failure("start_encounter", e))?;
    *ctx.encounter = Some(EncounterLive::new(id));
    Ok(())
}

fn register_roll(
    ctx: &mut MacroCtx,
    entry: InitiativeEntry,
) -> Result<(), CmdError> {
    ensure_encounter(ctx)?;
    let Some(enc) = ctx.encounter.as_mut() else {
        return Err(internal_failure("initiative", "encounter missing after start"));
    };
    let row = entry.to_row(&enc.id);
    ctx.store
        .upsert_initiative_roll(&row)
        .map_err(|e| store_failure("upsert_initiative_roll", e))?;
    enc.upsert(entry);
    Ok(())
}

fn initiative_frame(
    actor: &str,
    roll: i32,
    edge: i32,
    total: i32,
    combatant_name: &str,
    silent: bool,
    rolled_by_sw: bool,
) -> ServerFrame {
    let dice = Notation::Dice {
        count: 1,
        sides: 6,
        modifier: edge,
    }
    .display();
    let breakdown = vec![roll];
    let text = if edge == 0 {
        format!("Initiative for {combatant_name}: {roll} = {total}")
    } else {
        format!("Initiative for {combatant_name}: {roll} + {edge} = {total}")
    };
    ServerFrame::Initiative {
        actor: actor.to_string(),
        dice,
        breakdown,
        modifier: edge,
        result: total,
        text,
        silent,
        rolled_by_sw,
        combatant_name: combatant_name.to_string(),
    }
}

fn initiative_self(ctx: &mut MacroCtx, sender: &Sender) -> Result<Dispatch, CmdError> {
    let chr = bound_character(ctx, sender)?;
    let roll = ctx.rng.roll_die(6);
    let total = roll + chr.edge;
    let entry = InitiativeEntry {
        combatant: CombatantId::Character(chr.id.clone()),
        name: chr.name.clone(),
        total,
        pp: chr.pp,
        ip: chr.ip,
        sp: chr.sp,
        silent: false,
        rolled_by_sw: sender.is_sw,
        owner_user_id: Some(chr.owner_user_id.clone()),
        hidden_npc: false,
    };
    register_roll(ctx, entry)?;
    let frame = initiative_frame(
        &sender.display,
        roll,
        chr.edge,
        total,
        &chr.name,
        false,
        sender.is_sw,
    );
    persist_frame(ctx, sender, &frame)?;
    Ok(Dispatch::broadcast(frame))
}

fn initiative_for_target(
    ctx: &mut MacroCtx,
    sender: &Sender,
    target_text: &str,
    silent: bool,
) -> Result<Dispatch, CmdError> {
    if !sw_only(ctx, sender, "roll initiative for others")? {
        return Ok(Dispatch::none());
    }
    let target = mentions::resolve_single(
        target_text,
        &ctx.party.id,
        sender.is_sw,
        ctx.cache,
        &*ctx.store,
        None,
    )?;

    let (combatant, name, edge, pp, ip, sp, owner, hidden) = match &target {
        Target::Character(c) => (
            CombatantId::Character(c.id.clone()),
            c.name.clone(),
            c.edge,
            c.pp,
            c.ip,
            c.sp,
            Some(c.owner_user_id.clone()),
            false,
        ),
        Target::Npc(n) => (
            CombatantId::Npc(n.id.clone()),
            n.name.clone(),
            n.edge,
            n.pp,
            n.ip,
            n.sp,
            None,
            !n.visible_to_players,
        ),
    };

    let roll = ctx.rng.roll_die(6);
    let total = roll + edge;
    let character_audience = match &combatant {
        CombatantId::Character(id) => Some(id.clone()),
        CombatantId::Npc(_) => None,
    };
    let entry = InitiativeEntry {
        combatant,
        name: name.clone(),
        total,
        pp,
        ip,
        sp,
        silent,
        rolled_by_sw: true,
        owner_user_id: owner,
        hidden_npc: hidden,
    };
    register_roll(ctx, entry)?;
    let frame = initiative_frame(&sender.display, roll, edge, total, &name, silent, true);
    persist_frame(ctx, sender, &frame)?;

    let audience = if silent || hidden {
        Audience::SwOnly {
            also_character: character_audience,
        }
    } else {
        Audience::All
    };
    Ok(Dispatch::broadcast_to(frame, audience))
}

fn initiative_show(ctx: &mut MacroCtx, sender: &Sender) -> Result<Dispatch, CmdError> {
    let Some(enc) = ctx.encounter.as_ref() else {
        return Err(CmdError::State("No active encounter.".to_string()));
    };
    let viewer = if sender.is_sw {
        Viewer::StoryWeaver
    } else {
        Viewer::Player {
            user_id: sender.user_id.as_deref(),
        }
    };
    let entries = enc.visible_entries(viewer);
    if entries.is_empty() {
        return Err(CmdError::State("No initiative rolls yet.".to_string()));
    }
    let mut text = String::from("Turn order:");
    for (i, e) in entries.iter().enumerate() {
        text.push_str(&format!("\n{}. {} ({})", i + 1, e.name, e.total));
    }
    Ok(Dispatch::private(ctx.system(text)))
}

fn initiative_end(
    ctx: &mut MacroCtx,
    sender: &Sender,
    restore_budgets: bool,
) -> Result<Dispatch, CmdError> {
    let what = if restore_budgets {
        "end the encounter"
    } else {
        "clear the encounter"
    };
    if !sw_only(ctx, sender, what)? {
        return Ok(Dispatch::none());
    }
    let Some(enc_id) = ctx.encounter.as_ref().map(|e| e.id.clone()) else {
        return Err(CmdError::State("No active encounter to end.".to_string()));
    };

    ctx.store
        .end_encounter(&enc_id, restore_budgets)
        .map_err(|e| store_failure("end_encounter", e))?;

    if restore_budgets {
        ctx.store
            .reset_ability_budgets(&ctx.party.id, ctx.cfg.uses_per_level)
            .map_err(|e| store_failure("reset_ability_budgets", e))?;
        let uses_per_level = ctx.cfg.uses_per_level;
        for (chr, abilities) in ctx.cache.characters_mut() {
            for a in abilities.iter_mut() {
                a.max_uses = uses_per_level * chr.level as i32;
                a.uses_remaining = a.max_uses;
            }
        }
    }
    *ctx.encounter = None;

    let text = if restore_budgets {
        "Encounter ended. Abilities restored."
    } else {
        "Encounter cleared."
    };
    let frame = ctx.system(text);
    persist_frame(ctx, sender, &frame)?;
    Ok(Dispatch::broadcast(frame))
}

fn handle_ability(
    ctx: &mut MacroCtx,
    sender: &Sender,
    cmd_lc: &str,
    rest: &str,
) -> Result<Dispatch, CmdError> {
    let unknown = || CmdError::Input(format!("Unknown command: {cmd_lc}"));

    let Some(char_id) = sender.character_id.as_deref() else {
        return Err(unknown());
    };
    let ability: AbilityRecord = ctx
        .cache
        .abilities(char_id)
        .and_then(|list| {
            list.iter()
                .find(|a| a.macro_command.eq_ignore_ascii_case(cmd_lc))
                .cloned()
        })
        .ok_or_else(unknown)?;
    let caster = bound_character(ctx, sender)?;

    let res = mentions::resolve(rest, &ctx.party.id, sender.is_sw, ctx.cache, &*ctx.store)
        .map_err(|e| store_failure("mention lookup", e))?;
    if let Some((tok, candidates)) = res.ambiguous.into_iter().next() {
        return Err(MentionError::Ambiguous(tok, candidates).into());
    }
    if let Some(tok) = res.unresolved.into_iter().next() {
        return Err(MentionError::Unresolved(tok).into());
    }
    let targets = res.mentions;

    let out = resolve_cast(ctx.rng, &ability, &caster, &targets, false)?;

    let new_uses = ability.uses_remaining - 1;
    let frame = ServerFrame::AbilityCast {
        caster: caster.name.clone(),
        ability: ability.display_name.clone(),
        targets: targets.iter().map(|t| t.name().to_string()).collect(),
        resolution: out.resolution.clone(),
        uses_remaining: new_uses,
    };

    append_combat_turn(
        ctx,
        &caster.id,
        &caster.name,
        ability.effect_type.as_str(),
        &frame,
        false,
    )?;
    persist_frame(ctx, sender, &frame)?;

    // Budget write-through, reverted if the store refuses.
    if let Some(a) = ctx.cache.ability_mut(&caster.id, &ability.macro_command) {
        a.uses_remaining = new_uses;
    }
    if let Err(e) = ctx.store.update_ability_uses(&ability.id, new_uses) {
        if let Some(a) = ctx.cache.ability_mut(&caster.id, &ability.macro_command) {
            a.uses_remaining = ability.uses_remaining;
        }
        return Err(store_failure("update_ability_uses", e));
    }

    // DP write-throughs; a failure rolls back everything applied so far.
    let mut applied: Vec<DpPrev> = Vec::new();
    for change in &out.dp_changes {
        match apply_dp_change(ctx, change) {
            Ok(prev) => applied.push(prev),
            Err(e) => {
                for prev in applied.iter().rev() {
                    revert_dp(ctx, prev);
                }
                if let Some(a) = ctx.cache.ability_mut(&caster.id, &ability.macro_command) {
                    a.uses_remaining = ability.uses_remaining;
                }
                let _ = ctx
                    .store
                    .update_ability_uses(&ability.id, ability.uses_remaining);
                return Err(e);
            }
        }
    }

    Ok(Dispatch::broadcast(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::model::{
        AbilityType, EffectType, NpcRecord, NpcType, PartyRecord, PartyType,
    };
    use crate::store::{FileStore, Fixture, InitiativeRow};

    fn party() -> PartyRecord {
        PartyRecord {
            id: "p1".into(),
            name: "The Long Road".into(),
            campaign_id: Some("camp1".into()),
            story_weaver_user_id: Some("sw".into()),
            party_type: PartyType::Story,
        }
    }

    fn alice() -> CharacterRecord {
        CharacterRecord {
            id: "c1".into(),
            name: "Alice".into(),
            owner_user_id: "u1".into(),
            party_id: "p1".into(),
            level: 5,
            pp: 3,
            ip: 2,
            sp: 1,
            dp: 25,
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

    fn goblin() -> NpcRecord {
        NpcRecord {
            id: "n1".into(),
            party_id: "p1".into(),
            name: "Goblin".into(),
            level: 3,
            pp: 2,
            ip: 2,
            sp: 2,
            dp: 12,
            max_dp: 20,
            edge: 1,
            bap: 2,
            attack_style: "2d4".into(),
            defense_die: "1d8".into(),
            visible_to_players: true,
            npc_type: NpcType::Hostile,
            created_by_user_id: "sw".into(),
        }
    }

    fn fireball() -> AbilityRecord {
        AbilityRecord {
            id: "a1".into(),
            character_id: "c1".into(),
            slot: 1,
            ability_type: AbilityType::Spell,
            display_name: "Fireball".into(),
            macro_command: "/fireball".into(),
            power_source: Stat::IP,
            effect_type: EffectType::Damage,
            die: "2d6".into(),
            is_aoe: true,
            max_uses: 15,
            uses_remaining: 15,
        }
    }

    fn base_store() -> FileStore {
        let mut store = FileStore::in_memory();
        store
            .load_fixture(Fixture {
                parties: vec![party()],
                characters: vec![alice()],
                npcs: vec![goblin()],
                abilities: vec![fireball()],
            })
            .unwrap();
        store
    }

    struct Harness {
        party: PartyRecord,
        cache: StatsCache,
        encounter: Option<EncounterLive>,
        store: FileStore,
        rng: Rng64,
        cfg: HubConfig,
        now_ms: u64,
        throttle: HashMap<String, u64>,
        online: Vec<OnlineEntry>,
    }

    impl Harness {
        fn new() -> Self {
            let mut cache = StatsCache::new();
            cache.install(Snapshot::Character {
                chr: alice(),
                abilities: vec![fireball()],
            });
            Self {
                party: party(),
                cache,
                encounter: None,
                store: base_store(),
                rng: Rng64::from_seed(7),
                cfg: HubConfig::default(),
                now_ms: 10_000,
                throttle: HashMap::new(),
                online: vec![OnlineEntry {
                    display: "Alice".into(),
                    character_id: Some("c1".into()),
                    is_sw: false,
                }],
            }
        }

        fn run_as(&mut self, sender: &Sender, text: &str) -> Dispatch {
            let mut ctx = MacroCtx {
                party: &self.party,
                cache: &mut self.cache,
                encounter: &mut self.encounter,
                store: &mut self.store,
                rng: &mut self.rng,
                cfg: &self.cfg,
                now_ms: self.now_ms,
                throttle: &mut self.throttle,
                online: &self.online,
            };
            dispatch(&mut ctx, sender, text)
        }

        fn run(&mut self, text: &str) -> Dispatch {
            let sender = player_sender();
            self.run_as(&sender, text)
        }
    }

    fn player_sender() -> Sender {
        Sender {
            display: "Alice".into(),
            user_id: Some("u1".into()),
            character_id: Some("c1".into()),
            is_sw: false,
        }
    }

    fn sw_sender() -> Sender {
        Sender {
            display: "Weaver".into(),
            user_id: Some("sw".into()),
            character_id: None,
            is_sw: true,
        }
    }

    fn private_text(d: &Dispatch) -> String {
        match &d.private {
            Some(ServerFrame::System { text, .. }) => text.clone(),
            other => panic!("expected private system frame, got {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_a_private_reply_only() {
        let mut h = Harness::new();
        let d = h.run("/teleport home");
        assert!(d.broadcast.is_none());
        assert_eq!(private_text(&d), "Unknown command: /teleport");
    }

    #[test]
    fn roll_broadcasts_a_dice_roll_frame() {
        let mut h = Harness::new();
        let d = h.run("/roll 2d6+3");
        let (frame, audience) = d.broadcast.expect("broadcast expected");
        assert_eq!(audience, Audience::All);
        match frame {
            ServerFrame::DiceRoll {
                actor,
                dice,
                breakdown,
                modifier,
                result,
                ..
            } => {
                assert_eq!(actor, "Alice");
                assert_eq!(dice, "2d6+3");
                assert_eq!(breakdown.len(), 2);
                assert_eq!(modifier, 3);
                assert_eq!(result, breakdown.iter().sum::<i32>() + 3);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn roll_without_args_is_a_usage_error() {
        let mut h = Harness::new();
        let d = h.run("/roll");
        assert!(d.broadcast.is_none());
        assert!(private_text(&d).starts_with("Usage: /roll"));
    }

    #[test]
    fn throttle_rejects_back_to_back_macros() {
        let mut h = Harness::new();
        let first = h.run("/roll 1d6");
        assert!(first.broadcast.is_some());

        let second = h.run("/roll 1d6");
        assert!(second.broadcast.is_none());
        assert!(private_text(&second).starts_with("Slow down"));

        h.now_ms += 701;
        let third = h.run("/roll 1d6");
        assert!(third.broadcast.is_some());
    }

    #[test]
    fn stat_check_uses_cached_stats_for_bound_characters() {
        let mut h = Harness::new();
        let d = h.run("/pp");
        match d.broadcast.unwrap().0 {
            ServerFrame::StatRoll {
                stat,
                dice,
                modifier,
                breakdown,
                result,
                ..
            } => {
                assert_eq!(stat, "PP");
                // pp 3 + edge 2
                assert_eq!(modifier, 5);
                assert_eq!(dice, "1d6+5");
                assert_eq!(result, breakdown[0] + 5);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn stat_check_falls_back_to_placeholder_for_unbound_senders() {
        let mut h = Harness::new();
        let observer = Sender {
            display: "Watcher".into(),
            user_id: None,
            character_id: None,
            is_sw: false,
        };
        let d = h.run_as(&observer, "/sp");
        match d.broadcast.unwrap().0 {
            ServerFrame::StatRoll { modifier, .. } => assert_eq!(modifier, 1),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn attack_with_unknown_target_is_private_with_no_broadcast() {
        let mut h = Harness::new();
        let d = h.run("/attack @Phantom");
        assert!(d.broadcast.is_none());
        assert_eq!(
            private_text(&d),
            "Target not found: @Phantom. Use /who to see available targets."
        );
    }

    #[test]
    fn attack_without_target_is_a_usage_error() {
        let mut h = Harness::new();
        let d = h.run("/attack");
        assert_eq!(private_text(&d), "Usage: /attack @target");
    }

    #[test]
    fn attack_applies_damage_to_the_store_record() {
        let mut h = Harness::new();
        let d = h.run("/attack @Goblin");
        let (frame, _) = d.broadcast.expect("combat broadcast");
        match frame {
            ServerFrame::CombatResult {
                defender,
                total_damage,
                defender_new_dp,
                individual_rolls,
                ..
            } => {
                assert_eq!(defender, "Goblin");
                assert_eq!(individual_rolls.len(), 3);
                assert_eq!(defender_new_dp, 12 - total_damage);
                let stored = h.store.load_npc("n1").unwrap().unwrap();
                assert_eq!(stored.dp, defender_new_dp);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn who_hides_hidden_npcs_from_players_only() {
        let mut h = Harness::new();
        let mut shade = goblin();
        shade.id = "n2".into();
        shade.name = "Shade".into();
        shade.visible_to_players = false;
        h.store
            .load_fixture(Fixture {
                parties: vec![],
                characters: vec![],
                npcs: vec![shade],
                abilities: vec![],
            })
            .unwrap();

        let player_view = private_text(&h.run("/who"));
        assert!(player_view.contains("Goblin"));
        assert!(!player_view.contains("Shade"));

        h.now_ms += 1000;
        let sw_view = private_text(&h.run_as(&sw_sender(), "/who"));
        assert!(sw_view.contains("Shade (hidden)"));
    }

    #[test]
    fn initiative_opens_an_encounter_and_rerolls_replace() {
        let mut h = Harness::new();
        let d = h.run("/initiative");
        assert!(matches!(
            d.broadcast,
            Some((ServerFrame::Initiative { .. }, Audience::All))
        ));
        assert!(h.encounter.is_some());
        assert_eq!(h.encounter.as_ref().unwrap().entries.len(), 1);

        h.now_ms += 1000;
        h.run("/initiative");
        assert_eq!(h.encounter.as_ref().unwrap().entries.len(), 1);
    }

    #[test]
    fn sw_only_commands_reject_players_under_the_default_policy() {
        let mut h = Harness::new();
        h.run("/initiative");
        h.now_ms += 1000;
        let d = h.run("/initiative end");
        assert!(d.broadcast.is_none());
        assert!(private_text(&d).starts_with("Only the Story Weaver"));
        assert!(h.encounter.is_some());
    }

    #[test]
    fn sw_only_commands_vanish_under_the_ignore_policy() {
        let mut h = Harness::new();
        h.cfg.visibility = VisibilityPolicy::Ignore;
        h.run("/initiative");
        h.now_ms += 1000;
        let d = h.run("/initiative end");
        assert!(d.broadcast.is_none());
        assert!(d.private.is_none());
        assert!(h.encounter.is_some());
    }

    #[test]
    fn initiative_end_restores_budgets_and_is_then_a_state_error() {
        let mut h = Harness::new();
        h.run("/fireball @Goblin");
        assert_eq!(
            h.cache.abilities("c1").unwrap()[0].uses_remaining,
            14
        );
        h.now_ms += 1000;
        h.run("/initiative");

        h.now_ms += 1000;
        let d = h.run_as(&sw_sender(), "/initiative end");
        match &d.broadcast {
            Some((ServerFrame::System { text, .. }, Audience::All)) => {
                assert_eq!(text, "Encounter ended. Abilities restored.");
            }
            other => panic!("wrong broadcast: {other:?}"),
        }
        assert!(h.encounter.is_none());
        assert_eq!(h.cache.abilities("c1").unwrap()[0].uses_remaining, 15);
        let stored = h.store.list_abilities("c1").unwrap();
        assert_eq!(stored[0].uses_remaining, 15);

        h.now_ms += 1000;
        let again = h.run_as(&sw_sender(), "/initiative end");
        assert!(again.broadcast.is_none());
        assert_eq!(private_text(&again), "No active encounter to end.");
    }

    #[test]
    fn initiative_clear_skips_the_budget_reset() {
        let mut h = Harness::new();
        h.run("/fireball @Goblin");
        h.now_ms += 1000;
        h.run("/initiative");
        h.now_ms += 1000;
        let d = h.run_as(&sw_sender(), "/initiative clear");
        assert!(matches!(
            d.broadcast,
            Some((ServerFrame::System { .. }, Audience::All))
        ));
        assert!(h.encounter.is_none());
        assert_eq!(h.cache.abilities("c1").unwrap()[0].uses_remaining, 14);
    }

    #[test]
    fn silent_sw_roll_narrows_the_audience() {
        let mut h = Harness::new();
        let d = h.run_as(&sw_sender(), "/initiative silent @Goblin");
        match d.broadcast {
            Some((ServerFrame::Initiative { silent, .. }, Audience::SwOnly { .. })) => {
                assert!(silent);
            }
            other => panic!("wrong broadcast: {other:?}"),
        }
    }

    #[test]
    fn initiative_show_is_private_and_role_filtered() {
        let mut h = Harness::new();
        let no_enc = h.run("/initiative show");
        assert_eq!(private_text(&no_enc), "No active encounter.");

        h.now_ms += 1000;
        h.run("/initiative");
        h.now_ms += 1000;
        h.run_as(&sw_sender(), "/initiative silent @Goblin");

        h.now_ms += 1000;
        let player_view = private_text(&h.run("/initiative show"));
        assert!(player_view.contains("Alice"));
        assert!(!player_view.contains("Goblin"));

        h.now_ms += 1000;
        let sw_view = private_text(&h.run_as(&sw_sender(), "/initiative show"));
        assert!(sw_view.contains("Goblin"));
    }

    #[test]
    fn ability_cast_decrements_until_the_budget_runs_out() {
        let mut h = Harness::new();
        if let Some(a) = h.cache.ability_mut("c1", "/fireball") {
            a.uses_remaining = 1;
        }
        h.store.update_ability_uses("a1", 1).unwrap();

        let d = h.run("/fireball @Goblin");
        match d.broadcast.unwrap().0 {
            ServerFrame::AbilityCast { uses_remaining, .. } => assert_eq!(uses_remaining, 0),
            other => panic!("wrong frame: {other:?}"),
        }

        h.now_ms += 1000;
        let spent = h.run("/fireball @Goblin");
        assert!(spent.broadcast.is_none());
        assert!(private_text(&spent).contains("No uses of Fireball remain"));
    }

    // A store whose DP/budget write-throughs fail while reads and history
    // appends keep working, to drive the revert paths.
    struct FlakyStore {
        inner: FileStore,
        fail_updates: bool,
    }

    impl FlakyStore {
        fn unavailable<T>(&self) -> Result<T, StoreError> {
            Err(StoreError::Unavailable("backing store offline".into()))
        }
    }

    impl Store for FlakyStore {
        fn load_party(&self, id: &str) -> Result<Option<PartyRecord>, StoreError> {
            self.inner.load_party(id)
        }
        fn load_character(&self, id: &str) -> Result<Option<CharacterRecord>, StoreError> {
            self.inner.load_character(id)
        }
        fn load_npc(&self, id: &str) -> Result<Option<NpcRecord>, StoreError> {
            self.inner.load_npc(id)
        }
        fn list_party_characters(
            &self,
            party_id: &str,
        ) -> Result<Vec<CharacterRecord>, StoreError> {
            self.inner.list_party_characters(party_id)
        }
        fn list_party_npcs(
            &self,
            party_id: &str,
            include_hidden: bool,
        ) -> Result<Vec<NpcRecord>, StoreError> {
            self.inner.list_party_npcs(party_id, include_hidden)
        }
        fn list_abilities(&self, character_id: &str) -> Result<Vec<AbilityRecord>, StoreError> {
            self.inner.list_abilities(character_id)
        }
        fn append_message(&mut self, row: &MessageRow) -> Result<(), StoreError> {
            self.inner.append_message(row)
        }
        fn append_combat_turn(&mut self, row: &CombatTurnRow) -> Result<(), StoreError> {
            self.inner.append_combat_turn(row)
        }
        fn start_encounter(&mut self, party_id: &str) -> Result<Id, StoreError> {
            self.inner.start_encounter(party_id)
        }
        fn end_encounter(&mut self, id: &str, restore_budgets: bool) -> Result<(), StoreError> {
            self.inner.end_encounter(id, restore_budgets)
        }
        fn upsert_initiative_roll(&mut self, row: &InitiativeRow) -> Result<(), StoreError> {
            self.inner.upsert_initiative_roll(row)
        }
        fn reset_ability_budgets(
            &mut self,
            party_id: &str,
            uses_per_level: i32,
        ) -> Result<(), StoreError> {
            self.inner.reset_ability_budgets(party_id, uses_per_level)
        }
        fn update_character_dp(
            &mut self,
            id: &str,
            dp: i32,
            status: CharStatus,
            in_calling: bool,
        ) -> Result<(), StoreError> {
            if self.fail_updates {
                return self.unavailable();
            }
            self.inner.update_character_dp(id, dp, status, in_calling)
        }
        fn update_npc_dp(&mut self, id: &str, dp: i32) -> Result<(), StoreError> {
            if self.fail_updates {
                return self.unavailable();
            }
            self.inner.update_npc_dp(id, dp)
        }
        fn update_ability_uses(&mut self, id: &str, uses: i32) -> Result<(), StoreError> {
            if self.fail_updates {
                return self.unavailable();
            }
            self.inner.update_ability_uses(id, uses)
        }
    }

    #[test]
    fn store_failure_reverts_cache_mutations_and_stays_private() {
        let mut cache = StatsCache::new();
        cache.install(Snapshot::Character {
            chr: alice(),
            abilities: vec![fireball()],
        });
        cache.install(Snapshot::Npc { npc: goblin() });

        let mut store = FlakyStore {
            inner: base_store(),
            fail_updates: true,
        };
        let party = party();
        let mut encounter = None;
        let mut rng = Rng64::from_seed(7);
        let cfg = HubConfig::default();
        let mut throttle = HashMap::new();
        let online: Vec<OnlineEntry> = vec![];

        let mut ctx = MacroCtx {
            party: &party,
            cache: &mut cache,
            encounter: &mut encounter,
            store: &mut store,
            rng: &mut rng,
            cfg: &cfg,
            now_ms: 10_000,
            throttle: &mut throttle,
            online: &online,
        };
        let d = dispatch(&mut ctx, &player_sender(), "/attack @Goblin");
        assert!(d.broadcast.is_none());
        assert!(private_text(&d).contains("ref "));
        // The cached NPC keeps its pre-attack DP after the revert.
        assert_eq!(cache.npc_mut("n1").unwrap().dp, 12);

        // An ability cast against a failing store keeps its budget too.
        let mut ctx = MacroCtx {
            party: &party,
            cache: &mut cache,
            encounter: &mut encounter,
            store: &mut store,
            rng: &mut rng,
            cfg: &cfg,
            now_ms: 20_000,
            throttle: &mut throttle,
            online: &online,
        };
        let d = dispatch(&mut ctx, &player_sender(), "/fireball @Goblin");
        assert!(d.broadcast.is_none());
        assert_eq!(cache.abilities("c1").unwrap()[0].uses_remaining, 15);
        assert_eq!(cache.npc_mut("n1").unwrap().dp, 12);
    }

    #[test]
    fn verbosity_policy_gates_the_log_row_kinds() {
        let dice = ServerFrame::DiceRoll {
            actor: "a".into(),
            dice: "1d6".into(),
            breakdown: vec![4],
            modifier: 0,
            result: 4,
            text: "t".into(),
        };
        let stat = ServerFrame::StatRoll {
            actor: "a".into(),
            stat: "PP".into(),
            dice: "1d6".into(),
            breakdown: vec![4],
            modifier: 0,
            result: 4,
            text: "t".into(),
        };
        assert!(verbosity_allows(LogVerbosity::Macros, &dice));
        assert!(verbosity_allows(LogVerbosity::Macros, &stat));
        assert!(verbosity_allows(LogVerbosity::Minimal, &dice));
        assert!(!verbosity_allows(LogVerbosity::Minimal, &stat));
        assert!(!verbosity_allows(LogVerbosity::Off, &dice));
    }
}

