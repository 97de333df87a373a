//! End-to-end smoke: spawn the hub with a small fixture, connect two
//! sockets, and drive chat, a dice roll, `/who`, an attack, and a silent
//! SW initiative roll. Exits non-zero on the first missing frame.

use std::process::Stdio;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reader = SplitStream<Ws>;
type Writer = SplitSink<Ws, Message>;

const FIXTURE: &str = r#"{
  "parties": [
    {"id": "p1", "name": "Smoke Party", "campaign_id": "camp1",
     "story_weaver_user_id": "sw", "party_type": "story"}
  ],
  "characters": [
    {"id": "c1", "name": "Alice", "owner_user_id": "u1", "party_id": "p1",
     "level": 5, "pp": 3, "ip": 2, "sp": 1, "dp": 25, "max_dp": 30,
     "edge": 2, "bap": 3, "attack_style": "3d4", "defense_die": "1d8",
     "status": "active"}
  ],
  "npcs": [
    {"id": "n1", "party_id": "p1", "name": "Goblin", "level": 3,
     "pp": 2, "ip": 2, "sp": 2, "dp": 12, "max_dp": 20, "edge": 1, "bap": 2,
     "attack_style": "2d4", "defense_die": "1d8",
     "visible_to_players": true, "npc_type": "hostile",
     "created_by_user_id": "sw"}
  ],
  "abilities": []
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bind = "127.0.0.1:41310";

    let work = std::env::temp_dir().join(format!("party-hub-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&work)?;
    let fixture_path = work.join("fixture.json");
    std::fs::write(&fixture_path, FIXTURE)?;

    let mut hub = Command::new("target/debug/party_hub")
        .env("HUB_BIND", bind)
        .env("WORLD_SEED", "42")
        .env("DATA_DIR", work.join("data"))
        .env("FIXTURE", &fixture_path)
        .env("MACRO_THROTTLE_MS", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    wait_tcp(bind, Duration::from_secs(10)).await?;

    let res = run_scenario(bind).await;

    let _ = hub.kill().await;
    let _ = std::fs::remove_dir_all(&work);

    match &res {
        Ok(()) => println!("e2e_ws: ok"),
        Err(e) => eprintln!("e2e_ws: FAILED: {e}"),
    }
    res
}

async fn wait_tcp(bind: &str, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if TcpStream::connect(bind).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("timeout waiting for tcp {bind}");
}

async fn connect(bind: &str, query: &str) -> anyhow::Result<(Writer, Reader)> {
    let url = format!("ws://{bind}/chat/party/p1{query}");
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (sink, stream) = ws.split();
    Ok((sink, stream))
}

async fn send_json(sink: &mut Writer, value: serde_json::Value) -> anyhow::Result<()> {
    sink.send(Message::Text(value.to_string())).await?;
    Ok(())
}

/// Read frames until one satisfies `pred`, or fail at the deadline.
async fn expect_frame<F>(
    stream: &mut Reader,
    what: &str,
    mut pred: F,
) -> anyhow::Result<serde_json::Value>
where
    F: FnMut(&serde_json::Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let step = remaining.min(Duration::from_millis(300));
        let m = match tokio::time::timeout(step, stream.next()).await {
            Ok(v) => v,
            Err(_) => continue,
        };
        let Some(m) = m else {
            anyhow::bail!("stream closed while waiting for {what}");
        };
        let Message::Text(s) = m? else { continue };
        let Ok(v) = serde_json::from_str::<serde_json::Value>(&s) else {
            continue;
        };
        if pred(&v) {
            return Ok(v);
        }
    }
    anyhow::bail!("timed out waiting for {what}");
}

async fn run_scenario(bind: &str) -> anyhow::Result<()> {
    let (mut alice_tx, mut alice_rx) = connect(bind, "?character_id=c1&user_id=u1").await?;
    expect_frame(&mut alice_rx, "alice join notice", |v| {
        v["type"] == "system" && v["text"].as_str().unwrap_or("").contains("Alice")
    })
    .await?;

    let (mut sw_tx, mut sw_rx) = connect(bind, "?user_id=sw&name=Weaver").await?;
    expect_frame(&mut sw_rx, "sw join notice", |v| {
        v["type"] == "system" && v["text"].as_str().unwrap_or("").contains("Weaver (SW)")
    })
    .await?;

    // Plain chat fans out to both sockets.
    send_json(
        &mut alice_tx,
        serde_json::json!({"type": "message", "actor": "Alice", "text": "Hello"}),
    )
    .await?;
    for (rx, who) in [(&mut alice_rx, "alice"), (&mut sw_rx, "sw")] {
        let v = expect_frame(rx, &format!("chat echo for {who}"), |v| v["type"] == "chat").await?;
        anyhow::ensure!(v["actor"] == "Alice" && v["text"] == "Hello" && v["mode"] == "IC");
    }

    // Dice macro.
    send_json(
        &mut alice_tx,
        serde_json::json!({"type": "message", "actor": "Alice", "text": "/roll 2d6+3"}),
    )
    .await?;
    let v = expect_frame(&mut sw_rx, "dice_roll broadcast", |v| v["type"] == "dice_roll").await?;
    anyhow::ensure!(v["dice"] == "2d6+3");
    anyhow::ensure!(v["breakdown"].as_array().map(|a| a.len()) == Some(2));

    // /who is a private reply.
    send_json(
        &mut alice_tx,
        serde_json::json!({"type": "message", "actor": "Alice", "text": "/who"}),
    )
    .await?;
    let v = expect_frame(&mut alice_rx, "who listing", |v| {
        v["type"] == "system" && v["text"].as_str().unwrap_or("").contains("npcs:")
    })
    .await?;
    anyhow::ensure!(v["text"].as_str().unwrap_or("").contains("Goblin"));

    // Attack resolves and reports the defender's new DP.
    send_json(
        &mut alice_tx,
        serde_json::json!({"type": "message", "actor": "Alice", "text": "/attack @Goblin"}),
    )
    .await?;
    let v = expect_frame(&mut sw_rx, "combat_result broadcast", |v| {
        v["type"] == "combat_result"
    })
    .await?;
    anyhow::ensure!(v["defender"] == "Goblin");
    let dmg = v["total_damage"].as_i64().unwrap_or(-1);
    anyhow::ensure!(v["defender_new_dp"].as_i64() == Some(12 - dmg));

    // Silent SW initiative roll reaches the SW socket.
    send_json(
        &mut sw_tx,
        serde_json::json!({"type": "message", "actor": "Weaver", "text": "/initiative silent @Goblin"}),
    )
    .await?;
    let v = expect_frame(&mut sw_rx, "silent initiative", |v| v["type"] == "initiative").await?;
    anyhow::ensure!(v["silent"] == true && v["combatant_name"] == "Goblin");

    // Ping round-trips.
    send_json(&mut alice_tx, serde_json::json!({"type": "ping"})).await?;
    expect_frame(&mut alice_rx, "pong", |v| v["type"] == "pong").await?;

    Ok(())
}
