use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use getrandom::getrandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn, Level};

use tableproto::client::parse_client_frame;
use tableproto::conn::ConnId;
use tableproto::server::ServerFrame;
use tableproto::{now_ts, ProtoError};

mod abilities;
mod cache;
mod dice;
mod hub;
mod initiative;
mod macros;
mod mentions;
mod model;
mod store;

use hub::{PartyCmd, Registry, SharedStore};
use macros::{HubConfig, LogVerbosity, VisibilityPolicy};
use store::FileStore;

#[derive(Debug, Clone)]
struct Config {
    bind: SocketAddr,
    throttle_ms: u64,
    verbosity: LogVerbosity,
    visibility: VisibilityPolicy,
    uses_per_level: i32,
    seed: Option<u64>,
    data_dir: PathBuf,
    fixture: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
    eprintln!(
        "party_hub\n\n\
USAGE:\n  party_hub [--bind HOST:PORT] [--throttle-ms N] [--log-verbosity macros|minimal|off]\n            [--visibility-policy reject|ignore] [--uses-per-level N] [--seed N]\n            [--data-dir PATH] [--fixture PATH]\n\n\
ENV:\n  HUB_BIND                 default 127.0.0.1:4300\n  MACRO_THROTTLE_MS        default 700\n  WS_LOG_VERBOSITY         default macros\n  VISIBILITY_POLICY        default reject\n  ABILITY_MAX_USES_PER_LEVEL  default 3\n  WORLD_SEED               default: entropy\n  DATA_DIR                 default data\n  FIXTURE                  default: none\n"
    );
    std::process::exit(2);
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = env_or("HUB_BIND", "127.0.0.1:4300")
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut throttle_ms: u64 = env_or("MACRO_THROTTLE_MS", "700")
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut verbosity = LogVerbosity::parse(&env_or("WS_LOG_VERBOSITY", "macros"))
        .unwrap_or_else(|| usage_and_exit());
    let mut visibility = VisibilityPolicy::parse(&env_or("VISIBILITY_POLICY", "reject"))
        .unwrap_or_else(|| usage_and_exit());
    let mut uses_per_level: i32 = env_or("ABILITY_MAX_USES_PER_LEVEL", "3")
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut seed: Option<u64> = std::env::var("WORLD_SEED")
        .ok()
        .map(|v| v.parse().unwrap_or_else(|_| usage_and_exit()));
    let mut data_dir = PathBuf::from(env_or("DATA_DIR", "data"));
    let mut fixture: Option<PathBuf> = std::env::var("FIXTURE").ok().map(PathBuf::from);

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--throttle-ms" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                throttle_ms = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--log-verbosity" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                verbosity = LogVerbosity::parse(&v).unwrap_or_else(|| usage_and_exit());
            }
            "--visibility-policy" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                visibility = VisibilityPolicy::parse(&v).unwrap_or_else(|| usage_and_exit());
            }
            "--uses-per-level" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                uses_per_level = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--seed" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                seed = Some(v.parse().unwrap_or_else(|_| usage_and_exit()));
            }
            "--data-dir" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                data_dir = PathBuf::from(v);
            }
            "--fixture" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                fixture = Some(PathBuf::from(v));
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        throttle_ms,
        verbosity,
        visibility,
        uses_per_level,
        seed,
        data_dir,
        fixture,
    }
}

fn new_conn_id() -> ConnId {
    let mut b = [0u8; 16];
    getrandom(&mut b).expect("getrandom");
    ConnId::from_be_bytes(b)
}

fn entropy_seed() -> u64 {
    let mut b = [0u8; 8];
    getrandom(&mut b).expect("getrandom");
    u64::from_be_bytes(b)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SessionParams {
    character_id: Option<String>,
    user_id: Option<String>,
    name: Option<String>,
}

/// `/chat/party/{party_id}?character_id=..&user_id=..&name=..`
fn parse_session_params(uri: &str) -> Option<(String, SessionParams)> {
    let (path, query) = match uri.split_once('?') {
        Some((p, q)) => (p, q),
        None => (uri, ""),
    };
    let party_id = path
        .strip_prefix("/chat/party/")?
        .trim_end_matches('/')
        .to_string();
    if party_id.is_empty() || party_id.contains('/') {
        return None;
    }

    let mut params = SessionParams::default();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if v.is_empty() {
            continue;
        }
        match k {
            "character_id" => params.character_id = Some(v.to_string()),
            "user_id" | "credential" => params.user_id = Some(v.to_string()),
            "name" => params.name = Some(v.to_string()),
            _ => {}
        }
    }
    Some((party_id, params))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,party_hub=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();

    let store = FileStore::open(&cfg.data_dir, cfg.fixture.as_deref())
        .context("open entity store")?;
    let shared: SharedStore = Arc::new(Mutex::new(Box::new(store)));

    let hub_cfg = HubConfig {
        throttle_ms: cfg.throttle_ms,
        verbosity: cfg.verbosity,
        visibility: cfg.visibility,
        uses_per_level: cfg.uses_per_level,
    };
    let seed = cfg.seed.unwrap_or_else(entropy_seed);
    let registry = Registry::new(shared, hub_cfg, seed);

    let listener = TcpListener::bind(cfg.bind).await?;
    info!(bind = %cfg.bind, "party hub listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socket(stream, peer, registry).await {
                warn!(peer = %peer, err = %e, "socket ended with error");
            }
        });
    }
}

async fn handle_socket(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
) -> anyhow::Result<()> {
    let mut uri = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        uri = req.uri().to_string();
        Ok(resp)
    })
    .await
    .context("accept ws")?;

    let (mut sink, mut stream) = ws.split();

    let Some((party_id, params)) = parse_session_params(&uri) else {
        let reject = ServerFrame::System {
            text: "Expected path /chat/party/{party_id}".to_string(),
            party_id: String::new(),
            timestamp: now_ts(),
        };
        let _ = sink.send(Message::Text(reject.to_json())).await;
        return Ok(());
    };

    let (tx, mut rx) = mpsc::channel::<String>(128);

    // Writer task: the only place this socket is written to.
    let writer = tokio::spawn(async move {
        while let Some(s) = rx.recv().await {
            if sink.send(Message::Text(s)).await.is_err() {
                break;
            }
        }
    });

    let conn = new_conn_id();
    info!(peer = %peer, party = %party_id, conn = conn.short(), "client connected");
    registry
        .join(
            &party_id,
            PartyCmd::Join {
                conn,
                tx: tx.clone(),
                character_id: params.character_id,
                user_id: params.user_id,
                display: params.name,
            },
        )
        .await;

    while let Some(m) = stream.next().await {
        let m = match m {
            Ok(m) => m,
            Err(_) => break,
        };
        match m {
            Message::Text(s) => match parse_client_frame(&s) {
                Ok(frame) => {
                    registry
                        .send_existing(&party_id, PartyCmd::Frame { conn, frame })
                        .await;
                }
                Err(e) => {
                    // Malformed input never drops the socket.
                    let text = match e {
                        ProtoError::UnknownType(_) => {
                            "Unknown frame type. Supported: message, whisper, narration, ping."
                                .to_string()
                        }
                        ProtoError::BadJson(_) => {
                            "Malformed frame: expected a JSON object with a \"type\" field."
                                .to_string()
                        }
                    };
                    let reply = ServerFrame::System {
                        text,
                        party_id: party_id.clone(),
                        timestamp: now_ts(),
                    };
                    let _ = tx.send(reply.to_json()).await;
                }
            },
            Message::Binary(_) => {
                let reply = ServerFrame::System {
                    text: "Binary frames are not supported.".to_string(),
                    party_id: party_id.clone(),
                    timestamp: now_ts(),
                };
                let _ = tx.send(reply.to_json()).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {}
        }
    }

    registry
        .send_existing(&party_id, PartyCmd::Leave { conn })
        .await;
    drop(tx);
    let _ = writer.await;
    info!(peer = %peer, conn = conn.short(), "client disconnected");
    Ok(())
}
