#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    unused,
    reason = "Shared test scaffolding; not every test file uses every helper"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

/// What the server pushes to every connected client.
#[derive(Debug, Clone)]
enum Command {
    Text(String),
    /// Close every open connection with a close frame
    Kick,
}

/// Mock WebSocket server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast commands to ALL connected clients
    command_tx: broadcast::Sender<Command>,
    /// Envelopes received from clients, heartbeats excluded
    received_rx: mpsc::UnboundedReceiver<Value>,
    /// TCP connections accepted, successful or not
    attempts: Arc<AtomicUsize>,
    /// Completed WebSocket handshakes
    handshakes: Arc<AtomicUsize>,
    /// Heartbeat pings received
    pings: Arc<AtomicUsize>,
    /// When false, connections are dropped before the handshake
    accepting: Arc<AtomicBool>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<Command>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<Value>();
        let attempts = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));
        let accepting = Arc::new(AtomicBool::new(true));

        let server_commands = command_tx.clone();
        let server_attempts = Arc::clone(&attempts);
        let server_handshakes = Arc::clone(&handshakes);
        let server_pings = Arc::clone(&pings);
        let server_accepting = Arc::clone(&accepting);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                server_attempts.fetch_add(1, Ordering::SeqCst);

                if !server_accepting.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                // Subscribe before counting so a counted client never misses a command
                let mut command_rx = server_commands.subscribe();
                server_handshakes.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let received_tx = received_tx.clone();
                let pings = Arc::clone(&server_pings);

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            // Handle incoming messages from client
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let value: Value = serde_json::from_str(text.as_str()).unwrap();
                                        if value["type"] == "ping" {
                                            pings.fetch_add(1, Ordering::SeqCst);
                                        } else {
                                            drop(received_tx.send(value));
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            // Handle commands for this client
                            command = command_rx.recv() => {
                                match command {
                                    Ok(Command::Text(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Command::Kick) => {
                                        drop(write.send(Message::Close(None)).await);
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            command_tx,
            received_rx,
            attempts,
            handshakes,
            pings,
            accepting,
        }
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a text frame to all connected clients.
    pub fn send(&self, message: &str) {
        drop(self.command_tx.send(Command::Text(message.to_owned())));
    }

    /// Close every open connection from the server side.
    pub fn kick(&self) {
        drop(self.command_tx.send(Command::Kick));
    }

    /// Refuse (`false`) or allow (`true`) future handshakes.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Receive the next envelope sent by a client.
    pub async fn recv_message(&mut self) -> Option<Value> {
        timeout(Duration::from_secs(2), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive `count` envelopes and return their `type` fields.
    pub async fn recv_kinds(&mut self, count: usize) -> Vec<String> {
        let mut kinds = Vec::with_capacity(count);
        for _ in 0..count {
            let message = self.recv_message().await.unwrap();
            kinds.push(message["type"].as_str().unwrap().to_owned());
        }
        kinds
    }

    /// True if no envelope arrives within `window`.
    pub async fn is_quiet_for(&mut self, window: Duration) -> bool {
        timeout(window, self.received_rx.recv()).await.is_err()
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
