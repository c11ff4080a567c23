//! Master/worker dispatch over a long-lived framed socket.
//!
//! A master listens for worker connections; every connection must open
//! with an identity frame addressed to the master's UID. Workers send
//! heartbeats whenever their write lane idles; the master enforces a read
//! deadline and drops peers that miss it. Both sides route inbound frames
//! through an operation-keyed handler map.

pub mod frame;
mod master;
pub mod task;
mod worker;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use frame::{FrameCodec, NetData, DEFAULT_MAGIC, OP_HEARTBEAT, OP_IDENTITY};
pub use master::master_api;
pub use task::{Task, TaskJar, TaskSpider};
pub use worker::worker_api;

use frame::{STATUS_FAILURE, STATUS_REJECTED};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("magic header must be 6 bytes, got {0}")]
    BadMagicLength(usize),
    #[error("frame magic mismatch")]
    BadMagic,
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame too large: {0} bytes")]
    Oversize(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound frame handler for one operation name.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    /// Processes a frame; a returned value is sent back to the sender.
    async fn handle(&self, data: NetData) -> Option<NetData>;
}

pub type Api = HashMap<String, Arc<dyn ApiHandler>>;

/// UID the master answers to; workers address their identity frame here.
pub const MASTER_UID: &str = "master";

const MASTER_TIMEOUT: Duration = Duration::from_secs(20);
const WORKER_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const PEER_WAIT: Duration = Duration::from_secs(1);
const READ_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Master,
    Worker,
}

struct Peer {
    write_tx: mpsc::Sender<NetData>,
}

/// One dispatch endpoint: connection pool, handler map, frame codec
/// parameters and the cancel signal that tears everything down.
pub struct Dispatcher {
    uid: String,
    role: Role,
    magic: String,
    timeout: Duration,
    api: Api,
    conns: Mutex<HashMap<String, Peer>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn master(api: Api) -> Arc<Self> {
        Self::master_with_magic(api, DEFAULT_MAGIC)
    }

    /// Master endpoint with a custom 6-byte frame magic. Both ends of a
    /// deployment must agree on the magic.
    pub fn master_with_magic(api: Api, magic: &str) -> Arc<Self> {
        Arc::new(Self {
            uid: MASTER_UID.to_string(),
            role: Role::Master,
            magic: magic.to_string(),
            timeout: MASTER_TIMEOUT,
            api,
            conns: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn worker(uid: impl Into<String>, api: Api) -> Arc<Self> {
        Self::worker_with_magic(uid, api, DEFAULT_MAGIC)
    }

    pub fn worker_with_magic(uid: impl Into<String>, api: Api, magic: &str) -> Arc<Self> {
        Arc::new(Self {
            uid: uid.into(),
            role: Role::Worker,
            magic: magic.to_string(),
            timeout: WORKER_TIMEOUT,
            api,
            conns: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Connected peer count.
    pub fn count_nodes(&self) -> usize {
        self.conns.lock().len()
    }

    /// Master: bind and accept worker connections in the background.
    pub async fn serve(self: &Arc<Self>, port: u16) -> Result<(), DispatchError> {
        debug_assert_eq!(self.role, Role::Master);
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "dispatch listening");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let conn = Arc::clone(&this);
                            tokio::spawn(async move { conn.handle_worker_conn(stream, addr).await });
                        }
                        Err(err) => warn!(%err, "accept failed"),
                    }
                }
            }
        });
        Ok(())
    }

    /// Worker: keep a connection to the master alive, reconnecting after
    /// a drop until the dispatcher is closed.
    pub fn connect(self: &Arc<Self>, master_host: String, port: u16) {
        debug_assert_eq!(self.role, Role::Worker);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if this.cancel.is_cancelled() {
                    break;
                }
                match TcpStream::connect((master_host.as_str(), port)).await {
                    Ok(stream) => {
                        info!(master = %master_host, port, "connected to master");
                        this.run_master_link(stream).await;
                        if this.cancel.is_cancelled() {
                            break;
                        }
                        warn!("master link lost, reconnecting");
                    }
                    Err(err) => debug!(%err, "master unreachable, retrying"),
                }
                sleep(RECONNECT_PAUSE).await;
            }
        });
    }

    /// Pushes a frame toward any connected peer, waiting until one
    /// exists. Used for `task` requests and log forwarding.
    pub async fn request(&self, body: Value, operation: &str, flag: &str) {
        loop {
            let peer = {
                let conns = self.conns.lock();
                conns
                    .iter()
                    .next()
                    .map(|(uid, p)| (uid.clone(), p.write_tx.clone()))
            };
            if let Some((uid, tx)) = peer {
                let data = NetData::new(&self.uid, uid, operation, flag, body.clone());
                if tx.send(data).await.is_ok() {
                    return;
                }
            }
            if self.cancel.is_cancelled() {
                return;
            }
            sleep(PEER_WAIT).await;
        }
    }

    /// Tears down every connection and stops accept/reconnect loops.
    pub fn close(&self) {
        self.cancel.cancel();
        self.conns.lock().clear();
    }

    // --- connection plumbing ---

    async fn handle_worker_conn(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let Ok(mut codec) = FrameCodec::new(&self.magic) else {
            return;
        };
        let Ok(writer_codec) = FrameCodec::new(&self.magic) else {
            return;
        };
        let (mut read_half, write_half) = stream.into_split();

        let first = match self.read_one_frame(&mut read_half, &mut codec).await {
            Some(frame) => frame,
            None => return,
        };

        let (write_tx, write_rx) = mpsc::channel::<NetData>(256);
        spawn_writer(writer_codec, write_half, write_rx, None, String::new(), String::new());

        if first.operation != OP_IDENTITY || first.to != self.uid {
            warn!(%addr, from = %first.from, "rejecting peer without valid identity");
            let _ = write_tx
                .send(NetData::error_reply(
                    &first,
                    &self.uid,
                    STATUS_REJECTED,
                    "identity required",
                ))
                .await;
            return;
        }

        let peer_uid = first.from.clone();
        self.conns.lock().insert(
            peer_uid.clone(),
            Peer {
                write_tx: write_tx.clone(),
            },
        );
        info!(peer = %peer_uid, %addr, "worker connected");

        self.read_loop(&mut read_half, &mut codec, &write_tx, true).await;

        self.conns.lock().remove(&peer_uid);
        info!(peer = %peer_uid, %addr, "worker disconnected");
    }

    async fn run_master_link(self: &Arc<Self>, stream: TcpStream) {
        let Ok(mut codec) = FrameCodec::new(&self.magic) else {
            return;
        };
        let Ok(writer_codec) = FrameCodec::new(&self.magic) else {
            return;
        };
        let (mut read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel::<NetData>(256);

        // the worker's write lane emits heartbeats while idle
        spawn_writer(
            writer_codec,
            write_half,
            write_rx,
            Some(self.timeout),
            self.uid.clone(),
            MASTER_UID.to_string(),
        );

        let identity = NetData::new(&self.uid, MASTER_UID, OP_IDENTITY, "", Value::Null);
        if write_tx.send(identity).await.is_err() {
            return;
        }
        self.conns.lock().insert(
            MASTER_UID.to_string(),
            Peer {
                write_tx: write_tx.clone(),
            },
        );

        self.read_loop(&mut read_half, &mut codec, &write_tx, false).await;
        self.conns.lock().remove(MASTER_UID);
    }

    /// Drains frames until the peer closes, a decode error occurs, the
    /// dispatcher is cancelled, or (with `deadline`) a read deadline
    /// passes without traffic.
    async fn read_loop(
        self: &Arc<Self>,
        read_half: &mut OwnedReadHalf,
        codec: &mut FrameCodec,
        reply_tx: &mpsc::Sender<NetData>,
        deadline: bool,
    ) {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            // drain frames already buffered (the handshake read may have
            // pulled in more than the identity frame)
            loop {
                match codec.next_frame() {
                    Ok(Some(frame)) => {
                        if frame.operation == OP_HEARTBEAT {
                            continue;
                        }
                        self.dispatch(frame, reply_tx.clone());
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "dropping connection on bad frame");
                        return;
                    }
                }
            }

            let read = if deadline {
                match timeout(self.timeout, read_half.read(&mut buf)).await {
                    Err(_) => {
                        warn!("peer missed heartbeat deadline");
                        return;
                    }
                    Ok(r) => r,
                }
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    r = read_half.read(&mut buf) => r,
                }
            };

            let n = match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            codec.feed(&buf[..n]);
        }
    }

    /// Routes one frame through the handler map on its own task; a reply
    /// goes back to the sender, an unknown operation earns an error frame.
    fn dispatch(self: &Arc<Self>, data: NetData, reply_tx: mpsc::Sender<NetData>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let sender = data.from.clone();
            match this.api.get(&data.operation) {
                Some(handler) => {
                    if let Some(mut reply) = handler.handle(data).await {
                        reply.from = this.uid.clone();
                        reply.to = sender;
                        let _ = reply_tx.send(reply).await;
                    }
                }
                None => {
                    warn!(operation = %data.operation, from = %sender, "unknown operation");
                    let _ = reply_tx
                        .send(NetData::error_reply(
                            &data,
                            &this.uid,
                            STATUS_FAILURE,
                            "unknown operation",
                        ))
                        .await;
                }
            }
        });
    }

    /// Reads until one complete frame arrives, bounded by the endpoint
    /// timeout. Used for the identity handshake.
    async fn read_one_frame(
        &self,
        read_half: &mut OwnedReadHalf,
        codec: &mut FrameCodec,
    ) -> Option<NetData> {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            if let Ok(Some(frame)) = codec.next_frame() {
                return Some(frame);
            }
            let n = match timeout(self.timeout, read_half.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => n,
                _ => return None,
            };
            codec.feed(&buf[..n]);
        }
    }
}

/// Write lane for one connection. With `heartbeat_every`, an idle lane
/// emits heartbeat frames instead of going quiet.
fn spawn_writer(
    codec: FrameCodec,
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<NetData>,
    heartbeat_every: Option<Duration>,
    own_uid: String,
    peer_uid: String,
) {
    tokio::spawn(async move {
        loop {
            let next = match heartbeat_every {
                Some(idle) => match timeout(idle, write_rx.recv()).await {
                    Err(_) => Some(NetData::new(
                        &own_uid,
                        &peer_uid,
                        OP_HEARTBEAT,
                        "",
                        Value::Null,
                    )),
                    Ok(received) => received,
                },
                None => write_rx.recv().await,
            };
            let Some(data) = next else { break };
            let Ok(bytes) = codec.encode(&data) else {
                continue;
            };
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl ApiHandler for EchoHandler {
        async fn handle(&self, data: NetData) -> Option<NetData> {
            Some(NetData::new("", "", "echo", "", json!({ "got": data.body })))
        }
    }

    struct RecordHandler {
        seen: flume::Sender<NetData>,
    }

    #[async_trait]
    impl ApiHandler for RecordHandler {
        async fn handle(&self, data: NetData) -> Option<NetData> {
            let _ = self.seen.send(data);
            None
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn round_trip_request_and_reply() {
        let port = free_port().await;

        let mut master_handlers: Api = HashMap::new();
        master_handlers.insert("echo".to_string(), Arc::new(EchoHandler));
        let master = Dispatcher::master(master_handlers);
        master.serve(port).await.unwrap();

        let (seen_tx, seen_rx) = flume::unbounded();
        let mut worker_handlers: Api = HashMap::new();
        worker_handlers.insert("echo".to_string(), Arc::new(RecordHandler { seen: seen_tx }));
        let worker = Dispatcher::worker("worker-1", worker_handlers);
        worker.connect("127.0.0.1".to_string(), port);

        worker.request(json!("ping"), "echo", "").await;

        let reply = seen_rx.recv_async().await.unwrap();
        assert_eq!(reply.body["got"], json!("ping"));
        assert_eq!(reply.from, MASTER_UID);
        assert_eq!(reply.to, "worker-1");
        assert_eq!(master.count_nodes(), 1);

        worker.close();
        master.close();
    }

    #[tokio::test]
    async fn connection_without_identity_is_rejected() {
        let port = free_port().await;
        let master = Dispatcher::master(HashMap::new());
        master.serve(port).await.unwrap();

        let codec = FrameCodec::new(DEFAULT_MAGIC).unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // first frame is not an identity
        let bogus = NetData::new("rogue", MASTER_UID, "task", "", Value::Null);
        stream.write_all(&codec.encode(&bogus).unwrap()).await.unwrap();

        let mut decoder = FrameCodec::new(DEFAULT_MAGIC).unwrap();
        let mut buf = vec![0u8; 4096];
        let reply = loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "master closed without a status frame");
            decoder.feed(&buf[..n]);
            if let Some(frame) = decoder.next_frame().unwrap() {
                break frame;
            }
        };
        assert_eq!(reply.status, STATUS_REJECTED);
        assert_eq!(master.count_nodes(), 0);
        master.close();
    }
}
