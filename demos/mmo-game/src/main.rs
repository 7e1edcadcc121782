//! A tiny multiplayer world on top of tcpforge.
//!
//! Message types:
//!
//! | id  | direction | payload                                  |
//! |-----|-----------|------------------------------------------|
//! | 1   | s → c     | `pid: i32`                               |
//! | 2   | c → s     | chat text (UTF-8)                        |
//! | 3   | c → s     | `x, y, z, v: f32`                        |
//! | 200 | s → c     | `pid: i32, x, y, z, v: f32`              |
//! | 201 | s → c     | `pid: i32` (player left)                 |
//! | 257 | s → c     | `pid: i32` followed by chat text         |
//!
//! Run with an optional JSON config path:
//!
//! ```text
//! cargo run -p mmo-game-demo -- config.json
//! ```

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tcpforge::prelude::*;
use tracing::{info, warn};

const MSG_SYNC_PID: u32 = 1;
const MSG_CHAT: u32 = 2;
const MSG_MOVE: u32 = 3;
const MSG_POSITION: u32 = 200;
const MSG_LEFT: u32 = 201;
const MSG_CHAT_BROADCAST: u32 = 257;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
    v: f32,
}

impl Position {
    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != 16 {
            return None;
        }
        let f = |i: usize| f32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Some(Self {
            x: f(0),
            y: f(4),
            z: f(8),
            v: f(12),
        })
    }

    fn encode(&self, pid: i32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_i32_le(pid);
        buf.put_f32_le(self.x);
        buf.put_f32_le(self.y);
        buf.put_f32_le(self.z);
        buf.put_f32_le(self.v);
        buf
    }
}

#[derive(Default)]
struct World {
    next_pid: AtomicI32,
    players: Mutex<HashMap<i32, Position>>,
}

impl World {
    fn join(&self) -> (i32, Position) {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 1;
        // Spread spawn points a little so players don't stack.
        let offset = (pid % 10) as f32;
        let pos = Position {
            x: 160.0 + offset,
            y: 0.0,
            z: 140.0 + offset,
            v: 0.0,
        };
        self.lock().insert(pid, pos);
        (pid, pos)
    }

    fn update(&self, pid: i32, pos: Position) -> bool {
        match self.lock().get_mut(&pid) {
            Some(slot) => {
                *slot = pos;
                true
            }
            None => false,
        }
    }

    fn leave(&self, pid: i32) {
        self.lock().remove(&pid);
    }

    fn online(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Position>> {
        self.players
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct WorldChat {
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl Handler for WorldChat {
    async fn handle(&self, req: &Request) -> Result<()> {
        let pid: i32 = req.conn().property("pid")?;
        let text = req.message().as_text().unwrap_or_default();
        info!("player {} says: {}", pid, text);

        let mut payload = BytesMut::with_capacity(4 + text.len());
        payload.put_i32_le(pid);
        payload.put_slice(text.as_bytes());
        self.registry.broadcast(MSG_CHAT_BROADCAST, payload).await;
        Ok(())
    }
}

struct Move {
    world: Arc<World>,
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl Handler for Move {
    async fn pre_handle(&self, req: &Request) -> Result<()> {
        if req.conn().property::<i32>("pid").is_err() {
            warn!("connection {} moved without a pid, closing", req.conn_id());
            req.conn().stop();
            return Err(Error::PropertyNotFound("pid".into()));
        }
        Ok(())
    }

    async fn handle(&self, req: &Request) -> Result<()> {
        let pid: i32 = req.conn().property("pid")?;
        let Some(pos) = Position::decode(req.data()) else {
            return Err(Error::custom(format!(
                "move from player {} has {} bytes, expected 16",
                pid,
                req.data().len()
            )));
        };

        if self.world.update(pid, pos) {
            self.registry
                .broadcast_except(req.conn_id(), MSG_POSITION, pos.encode(pid))
                .await;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log = logging::init(LogSink::Stderr, LogFormat::Full)?;

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json_file(&path)?,
        None => ServerConfig::default().with_name("mmo-game"),
    };

    let server = Server::new(config);
    let world = Arc::new(World::default());
    let registry = server.registry();

    let w = world.clone();
    server.set_on_connect(move |conn| {
        let (pid, pos) = w.join();
        conn.set_property("pid", pid);

        if let Err(e) = conn.try_send_buffered(MSG_SYNC_PID, pid.to_le_bytes()) {
            warn!("failed to sync pid {}: {}", pid, e);
        }
        if let Err(e) = conn.try_send_buffered(MSG_POSITION, pos.encode(pid)) {
            warn!("failed to send start position to {}: {}", pid, e);
        }
        info!("player {} arrived, {} online", pid, w.online());
    });

    let w = world.clone();
    let r = registry.clone();
    server.set_on_disconnect(move |conn| {
        let Ok(pid) = conn.property::<i32>("pid") else {
            return;
        };
        w.leave(pid);
        info!("player {} left, {} online", pid, w.online());

        let registry = r.clone();
        tokio::spawn(async move {
            registry.broadcast(MSG_LEFT, pid.to_le_bytes()).await;
        });
    });

    server.add_route(
        MSG_CHAT,
        WorldChat {
            registry: registry.clone(),
        },
    );
    server.add_route(MSG_MOVE, Move { world, registry });

    server.serve().await
}
