//! `@mention` target resolution.
//!
//! Tokens are matched case-insensitively with underscores standing in for
//! spaces, so `@Mira_Quill` addresses "Mira Quill". Resolution order:
//! live cache first, then the party's character records, then its NPCs
//! (hidden NPCs only resolve for the Story Weaver).

use crate::cache::StatsCache;
use crate::model::{CharacterRecord, NpcRecord};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone)]
pub enum Target {
    Character(CharacterRecord),
    Npc(NpcRecord),
}

impl Target {
    pub fn id(&self) -> &str {
        match self {
            Target::Character(c) => &c.id,
            Target::Npc(n) => &n.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Target::Character(c) => &c.name,
            Target::Npc(n) => &n.name,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Target::Character(_) => "character",
            Target::Npc(_) => "npc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Character,
    Npc,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub mentions: Vec<Target>,
    pub unresolved: Vec<String>,
    /// Token plus the display names of every candidate it matched.
    pub ambiguous: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone)]
pub enum MentionError {
    NoTarget,
    MultipleTargets(Vec<String>),
    Unresolved(String),
    Ambiguous(String, Vec<String>),
    WrongType {
        name: String,
        got: &'static str,
        want: &'static str,
    },
    Store(StoreError),
}

impl std::fmt::Display for MentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MentionError::NoTarget => {
                write!(f, "No target specified. Use @name to target a character or NPC.")
            }
            MentionError::MultipleTargets(names) => write!(
                f,
                "Multiple targets found: {}. This command expects exactly one target.",
                names.join(", ")
            ),
            MentionError::Unresolved(tok) => write!(
                f,
                "Target not found: @{tok}. Use /who to see available targets."
            ),
            MentionError::Ambiguous(tok, candidates) => write!(
                f,
                "@{tok} is ambiguous. Found: {}. Please be more specific.",
                candidates.join(", ")
            ),
            MentionError::WrongType { name, got, want } => {
                write!(f, "@{name} is a {got}, but this command expects a {want}.")
            }
            MentionError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MentionError {}

/// Pull every `@token` out of the text, raw (un-normalized) form.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'@' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            if end > start {
                out.push(text[start..end].to_string());
            }
            i = end;
        } else {
            i += 1;
        }
    }
    out
}

/// Lowercase and treat underscores as spaces for matching.
pub fn normalize_token(tok: &str) -> String {
    tok.trim().to_lowercase().replace('_', " ")
}

fn resolve_token(
    token: &str,
    party_id: &str,
    sender_is_sw: bool,
    cache: &StatsCache,
    store: &dyn Store,
    out: &mut Resolution,
) -> Result<(), StoreError> {
    let norm = normalize_token(token);

    // Priority 1: live cache, characters only. First hit wins outright.
    let cached = cache.characters_by_name(&norm);
    if let Some(c) = cached.first() {
        out.mentions.push(Target::Character((*c).clone()));
        return Ok(());
    }

    // Priority 2: every character bound to the party, online or not.
    let char_hits: Vec<CharacterRecord> = store
        .list_party_characters(party_id)?
        .into_iter()
        .filter(|c| c.name.to_lowercase() == norm)
        .collect();

    // Priority 3: party NPCs, visibility-filtered for players.
    let npc_hits: Vec<NpcRecord> = store
        .list_party_npcs(party_id, sender_is_sw)?
        .into_iter()
        .filter(|n| n.name.to_lowercase() == norm)
        .collect();

    match char_hits.len() + npc_hits.len() {
        0 => out.unresolved.push(token.to_string()),
        1 => {
            if let Some(c) = char_hits.into_iter().next() {
                out.mentions.push(Target::Character(c));
            } else if let Some(n) = npc_hits.into_iter().next() {
                out.mentions.push(Target::Npc(n));
            }
        }
        _ => {
            let mut names: Vec<String> = char_hits
                .iter()
                .map(|c| format!("{} (character)", c.name))
                .collect();
            names.extend(npc_hits.iter().map(|n| format!("{} (npc)", n.name)));
            out.ambiguous.push((token.to_string(), names));
        }
    }
    Ok(())
}

pub fn resolve(
    text: &str,
    party_id: &str,
    sender_is_sw: bool,
    cache: &StatsCache,
    store: &dyn Store,
) -> Result<Resolution, StoreError> {
    let mut out = Resolution::default();
    for token in extract_mentions(text) {
        resolve_token(&token, party_id, sender_is_sw, cache, store, &mut out)?;
    }
    Ok(out)
}

/// Strict variant for commands that take exactly one target.
pub fn resolve_single(
    text: &str,
    party_id: &str,
    sender_is_sw: bool,
    cache: &StatsCache,
    store: &dyn Store,
    expected: Option<TargetKind>,
) -> Result<Target, MentionError> {
    let res =
        resolve(text, party_id, sender_is_sw, cache, store).map_err(MentionError::Store)?;

    if let Some((tok, candidates)) = res.ambiguous.into_iter().next() {
        return Err(MentionError::Ambiguous(tok, candidates));
    }
    if let Some(tok) = res.unresolved.into_iter().next() {
        return Err(MentionError::Unresolved(tok));
    }
    let mut mentions = res.mentions;
    match mentions.len() {
        0 => Err(MentionError::NoTarget),
        1 => {
            let t = mentions.remove(0);
            if let Some(want) = expected {
                let ok = matches!(
                    (&t, want),
                    (Target::Character(_), TargetKind::Character) | (Target::Npc(_), TargetKind::Npc)
                );
                if !ok {
                    let want = match want {
                        TargetKind::Character => "character",
                        TargetKind::Npc => "npc",
                    };
                    return Err(MentionError::WrongType {
                        name: t.name().to_string(),
                        got: t.kind_str(),
                        want,
                    });
                }
            }
            Ok(t)
        }
        _ => Err(MentionError::MultipleTargets(
            mentions.iter().map(|t| t.name().to_string()).collect(),
        )),
    }
}
