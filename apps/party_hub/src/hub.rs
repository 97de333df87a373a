//! Party registry and the per-party actor.
//!
//! One task owns each live party. Sockets never touch party state
//! directly: the accept path sends `PartyCmd::Join`, the reader loop sends
//! `Frame`s, and disconnect sends `Leave`. All cache, throttle, and
//! encounter mutation happens inside the actor, so frames for one party are
//! totally ordered and every socket observes the same broadcast order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use tableproto::client::ClientFrame;
use tableproto::conn::ConnId;
use tableproto::server::ServerFrame;
use tableproto::{now_ts, ChatMode};

use crate::cache::{Snapshot, StatsCache};
use crate::dice::Rng64;
use crate::initiative::EncounterLive;
use crate::macros::{self, Audience, Dispatch, HubConfig, OnlineEntry, Sender, VisibilityPolicy};
use crate::model::{Id, PartyRecord};
use crate::store::{MessageRow, MessageType, Store};

pub type SharedStore = Arc<Mutex<Box<dyn Store>>>;

#[derive(Debug)]
pub enum PartyCmd {
    Join {
        conn: ConnId,
        tx: mpsc::Sender<String>,
        character_id: Option<Id>,
        user_id: Option<Id>,
        display: Option<String>,
    },
    Frame {
        conn: ConnId,
        frame: ClientFrame,
    },
    Leave {
        conn: ConnId,
    },
}

pub struct Registry {
    parties: Mutex<HashMap<Id, mpsc::Sender<PartyCmd>>>,
    store: SharedStore,
    cfg: HubConfig,
    seed: u64,
}

impl Registry {
    pub fn new(store: SharedStore, cfg: HubConfig, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            parties: Mutex::new(HashMap::new()),
            store,
            cfg,
            seed,
        })
    }

    /// Route a join to the party actor, spawning it on first contact.
    ///
    /// Returns a boxed future rather than using `async fn`: `party_task`
    /// calls back into `join` when handing off races, and leaving this as
    /// an opaque `impl Future` makes that mutual recursion an unresolvable
    /// cycle for the Send auto-trait check.
    pub fn join<'a>(
        self: &'a Arc<Self>,
        party_id: &'a str,
        cmd: PartyCmd,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = cmd;
            loop {
                let tx = {
                    let mut map = self.parties.lock().await;
                    match map.get(party_id) {
                        Some(tx) if !tx.is_closed() => tx.clone(),
                        _ => {
                            let (tx, rx) = mpsc::channel(256);
                            map.insert(party_id.to_string(), tx.clone());
                            tokio::spawn(party_task(
                                self.clone(),
                                party_id.to_string(),
                                tx.clone(),
                                rx,
                            ));
                            tx
                        }
                    }
                };
                match tx.send(cmd).await {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(returned)) => {
                        // The actor exited between lookup and send; retry fresh.
                        cmd = returned;
                        let mut map = self.parties.lock().await;
                        if map.get(party_id).map(|t| t.same_channel(&tx)).unwrap_or(false) {
                            map.remove(party_id);
                        }
                    }
                }
            }
        })
    }

    /// Route a frame or leave to an already-live party; dropped otherwise.
    pub async fn send_existing(&self, party_id: &str, cmd: PartyCmd) {
        let tx = {
            let map = self.parties.lock().await;
            map.get(party_id).cloned()
        };
        if let Some(tx) = tx {
            let _ = tx.send(cmd).await;
        }
    }

    async fn deregister(&self, party_id: &str, self_tx: &mpsc::Sender<PartyCmd>) {
        let mut map = self.parties.lock().await;
        if map
            .get(party_id)
            .map(|t| t.same_channel(self_tx))
            .unwrap_or(false)
        {
            map.remove(party_id);
        }
    }
}

#[derive(Debug, Clone)]
struct SocketInfo {
    tx: mpsc::Sender<String>,
    display: String,
    user_id: Option<Id>,
    character_id: Option<Id>,
    is_sw: bool,
}

struct PartyLive {
    party: PartyRecord,
    socks: HashMap<ConnId, SocketInfo>,
    cache: StatsCache,
    encounter: Option<EncounterLive>,
    throttle: HashMap<String, u64>,
    rng: Rng64,
    started: Instant,
}

impl PartyLive {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn system(&self, text: impl Into<String>) -> ServerFrame {
        ServerFrame::System {
            text: text.into(),
            party_id: self.party.id.clone(),
            timestamp: now_ts(),
        }
    }

    fn online(&self) -> Vec<OnlineEntry> {
        self.socks
            .values()
            .map(|s| OnlineEntry {
                display: s.display.clone(),
                character_id: s.character_id.clone(),
                is_sw: s.is_sw,
            })
            .collect()
    }

    async fn unicast(&self, conn: ConnId, frame: &ServerFrame) {
        if let Some(s) = self.socks.get(&conn) {
            let _ = s.tx.send(frame.to_json()).await;
        }
    }

    /// Serialize once, deliver to every matching socket. A receiver that
    /// closed mid-fan-out is skipped without aborting the rest.
    async fn fan_out(&self, frame: &ServerFrame, audience: &Audience) {
        let json = frame.to_json();
        for s in self.socks.values() {
            let wanted = match audience {
                Audience::All => true,
                Audience::SwOnly { also_character } => {
                    s.is_sw
                        || match (also_character, &s.character_id) {
                            (Some(want), Some(have)) => want == have,
                            _ => false,
                        }
                }
            };
            if wanted {
                let _ = s.tx.send(json.clone()).await;
            }
        }
    }
}

fn per_party_seed(seed: u64, party_id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    party_id.hash(&mut h);
    seed ^ h.finish()
}

async fn party_task(
    registry: Arc<Registry>,
    party_id: String,
    self_tx: mpsc::Sender<PartyCmd>,
    mut rx: mpsc::Receiver<PartyCmd>,
) {
    let party = {
        let guard = registry.store.lock().await;
        match guard.load_party(&party_id) {
            Ok(p) => p,
            Err(e) => {
                warn!(party = %party_id, err = %e, "party load failed");
                None
            }
        }
    };

    let mut live = party.map(|party| PartyLive {
        party,
        socks: HashMap::new(),
        cache: StatsCache::new(),
        encounter: None,
        throttle: HashMap::new(),
        rng: Rng64::from_seed(per_party_seed(registry.seed, &party_id)),
        started: Instant::now(),
    });

    while let Some(cmd) = rx.recv().await {
        match cmd {
            PartyCmd::Join {
                conn,
                tx,
                character_id,
                user_id,
                display,
            } => {
                let Some(live) = live.as_mut() else {
                    let reject = ServerFrame::System {
                        text: format!("Unknown party: {party_id}"),
                        party_id: party_id.clone(),
                        timestamp: now_ts(),
                    };
                    let _ = tx.send(reject.to_json()).await;
                    continue;
                };
                handle_join(&registry, live, conn, tx, character_id, user_id, display).await;
            }
            PartyCmd::Frame { conn, frame } => {
                if let Some(live) = live.as_mut() {
                    handle_frame(&registry, live, conn, frame).await;
                }
            }
            PartyCmd::Leave { conn } => {
                let empty = match live.as_mut() {
                    Some(live) => {
                        handle_leave(live, conn).await;
                        live.socks.is_empty()
                    }
                    None => true,
                };
                if empty {
                    break;
                }
            }
        }
    }

    registry.deregister(&party_id, &self_tx).await;
    // Joins raced past the deregistration land here; hand them back so a
    // fresh actor picks them up.
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        if matches!(cmd, PartyCmd::Join { .. }) {
            let registry = registry.clone();
            let party_id = party_id.clone();
            tokio::spawn(async move {
                registry.join(&party_id, cmd).await;
            });
        }
    }
    info!(party = %party_id, "party actor stopped");
}

async fn handle_join(
    registry: &Arc<Registry>,
    live: &mut PartyLive,
    conn: ConnId,
    tx: mpsc::Sender<String>,
    character_id: Option<Id>,
    user_id: Option<Id>,
    display: Option<String>,
) {
    let is_sw = match (&user_id, &live.party.story_weaver_user_id) {
        (Some(u), Some(sw)) => u == sw,
        _ => false,
    };

    let mut bound_character = None;
    let mut bound_name = None;
    if let Some(cid) = &character_id {
        let guard = registry.store.lock().await;
        match guard.load_character(cid) {
            Ok(Some(c)) if c.party_id == live.party.id => {
                let abilities = guard.list_abilities(&c.id).unwrap_or_default();
                bound_name = Some(c.name.clone());
                bound_character = Some(Snapshot::Character { chr: c, abilities });
            }
            Ok(Some(c)) => {
                warn!(party = %live.party.id, character = %c.id, "character bound to a different party; admitting unbound");
            }
            Ok(None) => match guard.load_npc(cid) {
                Ok(Some(n)) if n.party_id == live.party.id => {
                    bound_name = Some(n.name.clone());
                    bound_character = Some(Snapshot::Npc { npc: n });
                }
                _ => {
                    warn!(party = %live.party.id, character = %cid, "no such character; admitting unbound");
                }
            },
            Err(e) => {
                warn!(party = %live.party.id, character = %cid, err = %e, "character load failed; admitting unbound");
            }
        }
    }

    let bound_id = bound_character.as_ref().map(|s| s.id().to_string());
    if let Some(snap) = bound_character {
        live.cache.install(snap);
    }

    let display_name = bound_name
        .or(display)
        .unwrap_or_else(|| format!("observer-{:08x}", conn.short() as u32));

    live.socks.insert(
        conn,
        SocketInfo {
            tx,
            display: display_name.clone(),
            user_id,
            character_id: bound_id,
            is_sw,
        },
    );

    let role = if is_sw { "SW" } else { "player" };
    info!(party = %live.party.id, conn = conn.short(), name = %display_name, role, "socket joined");
    let frame = live.system(format!("{display_name} ({role}) joined the party"));
    live.fan_out(&frame, &Audience::All).await;
}

async fn handle_leave(live: &mut PartyLive, conn: ConnId) {
    let Some(info) = live.socks.remove(&conn) else {
        return;
    };
    // Each bound socket holds one reference; the entry evicts itself when
    // the last holder releases.
    if let Some(cid) = &info.character_id {
        live.cache.release(cid);
    }
    info!(party = %live.party.id, conn = conn.short(), name = %info.display, "socket left");
    let frame = live.system(format!("{} left the party", info.display));
    live.fan_out(&frame, &Audience::All).await;
}

async fn handle_frame(
    registry: &Arc<Registry>,
    live: &mut PartyLive,
    conn: ConnId,
    frame: ClientFrame,
) {
    let Some(info) = live.socks.get(&conn).cloned() else {
        return;
    };

    match frame {
        ClientFrame::Ping {} => {
            live.unicast(conn, &ServerFrame::Pong {}).await;
        }
        ClientFrame::Message {
            actor, text, mode, ..
        } => {
            if text.trim_start().starts_with('/') {
                run_macro(registry, live, conn, &info, text.trim()).await;
            } else {
                plain_chat(registry, live, conn, &info, actor, text, mode).await;
            }
        }
        ClientFrame::Whisper { to, text, .. } => {
            whisper(live, conn, &info, &to, &text).await;
        }
        ClientFrame::Narration { text, .. } => {
            narration(registry, live, conn, &info, text).await;
        }
    }
}

async fn run_macro(
    registry: &Arc<Registry>,
    live: &mut PartyLive,
    conn: ConnId,
    info: &SocketInfo,
    text: &str,
) {
    let sender = Sender {
        display: info.display.clone(),
        user_id: info.user_id.clone(),
        character_id: info.character_id.clone(),
        is_sw: info.is_sw,
    };
    let online = live.online();
    let now_ms = live.now_ms();

    let dispatch = {
        let mut guard = registry.store.lock().await;
        let mut ctx = macros::MacroCtx {
            party: &live.party,
            cache: &mut live.cache,
            encounter: &mut live.encounter,
            store: &mut **guard,
            rng: &mut live.rng,
            cfg: &registry.cfg,
            now_ms,
            throttle: &mut live.throttle,
            online: &online,
        };
        macros::dispatch(&mut ctx, &sender, text)
    };

    deliver_dispatch(live, conn, dispatch).await;
}

async fn deliver_dispatch(live: &PartyLive, conn: ConnId, dispatch: Dispatch) {
    if let Some(frame) = dispatch.private {
        live.unicast(conn, &frame).await;
    }
    if let Some((frame, audience)) = dispatch.broadcast {
        live.fan_out(&frame, &audience).await;
    }
}

async fn plain_chat(
    registry: &Arc<Registry>,
    live: &mut PartyLive,
    conn: ConnId,
    info: &SocketInfo,
    actor: String,
    text: String,
    mode: Option<ChatMode>,
) {
    let actor = if actor.trim().is_empty() {
        info.display.clone()
    } else {
        actor
    };
    let mode = mode.unwrap_or(ChatMode::IC);
    let frame = ServerFrame::Chat {
        actor: actor.clone(),
        text: text.clone(),
        mode,
        party_id: live.party.id.clone(),
        timestamp: now_ts(),
    };

    let row = MessageRow {
        party_id: live.party.id.clone(),
        campaign_id: live.party.campaign_id.clone(),
        sender_id: info
            .character_id
            .clone()
            .unwrap_or_else(|| format!("user:{}", info.display.to_lowercase())),
        sender_name: actor,
        message_type: MessageType::Chat,
        mode: Some(mode),
        content: text,
        extra_data: None,
        created_at: now_ts(),
    };
    {
        let mut guard = registry.store.lock().await;
        if let Err(e) = guard.append_message(&row) {
            warn!(party = %live.party.id, err = %e, "chat persist failed");
            let reply = live.system("Could not save that message. Try again shortly.");
            live.unicast(conn, &reply).await;
            return;
        }
    }
    live.fan_out(&frame, &Audience::All).await;
}

async fn whisper(live: &PartyLive, conn: ConnId, info: &SocketInfo, to: &str, text: &str) {
    let want = to.trim().replace('_', " ");
    let targets: Vec<ConnId> = live
        .socks
        .iter()
        .filter(|(id, s)| {
            **id != conn
                && (s.display.eq_ignore_ascii_case(&want)
                    || s
                        .character_id
                        .as_deref()
                        .and_then(|cid| live.cache.get(cid))
                        .map(|snap| snap.name().eq_ignore_ascii_case(&want))
                        .unwrap_or(false))
        })
        .map(|(id, _)| *id)
        .collect();

    if targets.is_empty() {
        let reply = live.system(format!("No one named {to} is online."));
        live.unicast(conn, &reply).await;
        return;
    }

    let frame = ServerFrame::Whisper {
        from: info.display.clone(),
        text: text.to_string(),
        party_id: live.party.id.clone(),
        timestamp: now_ts(),
    };
    for t in targets {
        live.unicast(t, &frame).await;
    }
    let echo = live.system(format!("You whisper to {to}: {text}"));
    live.unicast(conn, &echo).await;
}

async fn narration(
    registry: &Arc<Registry>,
    live: &mut PartyLive,
    conn: ConnId,
    info: &SocketInfo,
    text: String,
) {
    if !info.is_sw {
        match registry.cfg.visibility {
            VisibilityPolicy::Ignore => return,
            VisibilityPolicy::Reject => {
                let reply = live.system("Only the Story Weaver can narrate.");
                live.unicast(conn, &reply).await;
                return;
            }
        }
    }

    let frame = ServerFrame::Narration {
        actor: info.display.clone(),
        text: text.clone(),
        party_id: live.party.id.clone(),
        timestamp: now_ts(),
    };
    let row = MessageRow {
        party_id: live.party.id.clone(),
        campaign_id: live.party.campaign_id.clone(),
        sender_id: info
            .character_id
            .clone()
            .unwrap_or_else(|| format!("user:{}", info.display.to_lowercase())),
        sender_name: info.display.clone(),
        message_type: MessageType::Narration,
        mode: None,
        content: text,
        extra_data: None,
        created_at: now_ts(),
    };
    {
        let mut guard = registry.store.lock().await;
        if let Err(e) = guard.append_message(&row) {
            warn!(party = %live.party.id, err = %e, "narration persist failed");
            let reply = live.system("Could not save that narration. Try again shortly.");
            live.unicast(conn, &reply).await;
            return;
        }
    }
    live.fan_out(&frame, &Audience::All).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CharStatus, CharacterRecord, PartyType};
    use crate::store::{FileStore, Fixture};
    use tokio::time::{timeout, Duration};

    fn fixture() -> Fixture {
        Fixture {
            parties: vec![PartyRecord {
                id: "p1".into(),
                name: "P".into(),
                campaign_id: None,
                story_weaver_user_id: Some("sw".into()),
                party_type: PartyType::Story,
            }],
            characters: vec![CharacterRecord {
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
            }],
            npcs: vec![],
            abilities: vec![],
        }
    }

    fn registry() -> Arc<Registry> {
        let mut store = FileStore::in_memory();
        store.load_fixture(fixture()).unwrap();
        let shared: SharedStore = Arc::new(Mutex::new(Box::new(store)));
        Registry::new(shared, HubConfig::default(), 42)
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> ServerFrame {
        let raw = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        serde_json::from_str(&raw).expect("frame json")
    }

    #[tokio::test]
    async fn join_broadcasts_and_chat_reaches_every_socket() {
        let reg = registry();
        let (tx_a, mut rx_a) = mpsc::channel(32);
        let conn_a = ConnId(1);
        reg.join(
            "p1",
            PartyCmd::Join {
                conn: conn_a,
                tx: tx_a,
                character_id: Some("c1".into()),
                user_id: Some("u1".into()),
                display: None,
            },
        )
        .await;
        match recv_frame(&mut rx_a).await {
            ServerFrame::System { text, .. } => {
                assert_eq!(text, "Alice (player) joined the party");
            }
            other => panic!("wrong frame: {other:?}"),
        }

        let (tx_b, mut rx_b) = mpsc::channel(32);
        let conn_b = ConnId(2);
        reg.join(
            "p1",
            PartyCmd::Join {
                conn: conn_b,
                tx: tx_b,
                character_id: None,
                user_id: Some("sw".into()),
                display: Some("Weaver".into()),
            },
        )
        .await;
        // Both sockets see the SW join.
        match recv_frame(&mut rx_a).await {
            ServerFrame::System { text, .. } => assert_eq!(text, "Weaver (SW) joined the party"),
            other => panic!("wrong frame: {other:?}"),
        }
        recv_frame(&mut rx_b).await;

        reg.send_existing(
            "p1",
            PartyCmd::Frame {
                conn: conn_a,
                frame: ClientFrame::Message {
                    actor: "Alice".into(),
                    text: "Hello".into(),
                    mode: None,
                    context: None,
                    encounter_id: None,
                },
            },
        )
        .await;

        for rx in [&mut rx_a, &mut rx_b] {
            match recv_frame(rx).await {
                ServerFrame::Chat {
                    actor, text, mode, ..
                } => {
                    assert_eq!(actor, "Alice");
                    assert_eq!(text, "Hello");
                    assert_eq!(mode, ChatMode::IC);
                }
                other => panic!("wrong frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn macro_errors_stay_private_to_the_sender() {
        let reg = registry();
        let (tx_a, mut rx_a) = mpsc::channel(32);
        let (tx_b, mut rx_b) = mpsc::channel(32);
        reg.join(
            "p1",
            PartyCmd::Join {
                conn: ConnId(1),
                tx: tx_a,
                character_id: Some("c1".into()),
                user_id: Some("u1".into()),
                display: None,
            },
        )
        .await;
        recv_frame(&mut rx_a).await;
        reg.join(
            "p1",
            PartyCmd::Join {
                conn: ConnId(2),
                tx: tx_b,
                character_id: None,
                user_id: None,
                display: Some("Watcher".into()),
            },
        )
        .await;
        recv_frame(&mut rx_a).await;
        recv_frame(&mut rx_b).await;

        reg.send_existing(
            "p1",
            PartyCmd::Frame {
                conn: ConnId(1),
                frame: ClientFrame::Message {
                    actor: "Alice".into(),
                    text: "/nosuchmacro".into(),
                    mode: None,
                    context: None,
                    encounter_id: None,
                },
            },
        )
        .await;

        match recv_frame(&mut rx_a).await {
            ServerFrame::System { text, .. } => {
                assert_eq!(text, "Unknown command: /nosuchmacro");
            }
            other => panic!("wrong frame: {other:?}"),
        }
        // The other socket sees nothing: next event it receives is a fresh
        // broadcast, not the private error.
        reg.send_existing(
            "p1",
            PartyCmd::Frame {
                conn: ConnId(1),
                frame: ClientFrame::Message {
                    actor: "Alice".into(),
                    text: "after".into(),
                    mode: None,
                    context: None,
                    encounter_id: None,
                },
            },
        )
        .await;
        match recv_frame(&mut rx_b).await {
            ServerFrame::Chat { text, .. } => assert_eq!(text, "after"),
            other => panic!("error leaked to another socket: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_party_is_rejected() {
        let reg = registry();
        let (tx, mut rx) = mpsc::channel(32);
        reg.join(
            "ghost-party",
            PartyCmd::Join {
                conn: ConnId(9),
                tx,
                character_id: None,
                user_id: None,
                display: None,
            },
        )
        .await;
        match recv_frame(&mut rx).await {
            ServerFrame::System { text, .. } => {
                assert!(text.contains("Unknown party"));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn whisper_is_unicast_with_an_echo() {
        let reg = registry();
        let (tx_a, mut rx_a) = mpsc::channel(32);
        let (tx_b, mut rx_b) = mpsc::channel(32);
        reg.join(
            "p1",
            PartyCmd::Join {
                conn: ConnId(1),
                tx: tx_a,
                character_id: Some("c1".into()),
                user_id: Some("u1".into()),
                display: None,
            },
        )
        .await;
        recv_frame(&mut rx_a).await;
        reg.join(
            "p1",
            PartyCmd::Join {
                conn: ConnId(2),
                tx: tx_b,
                character_id: None,
                user_id: None,
                display: Some("Watcher".into()),
            },
        )
        .await;
        recv_frame(&mut rx_a).await;
        recv_frame(&mut rx_b).await;

        reg.send_existing(
            "p1",
            PartyCmd::Frame {
                conn: ConnId(2),
                frame: ClientFrame::Whisper {
                    actor: "Watcher".into(),
                    to: "Alice".into(),
                    text: "psst".into(),
                },
            },
        )
        .await;

        match recv_frame(&mut rx_a).await {
            ServerFrame::Whisper { from, text, .. } => {
                assert_eq!(from, "Watcher");
                assert_eq!(text, "psst");
            }
            other => panic!("wrong frame: {other:?}"),
        }
        match recv_frame(&mut rx_b).await {
            ServerFrame::System { text, .. } => {
                assert!(text.starts_with("You whisper to Alice"));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }
}
