//! Resilient WebSocket connection management.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: one logical connection with reconnection, heartbeat and an
//!   outbound queue that survives outages
//! - [`Handlers`]: callbacks for connection events, delivered in order on a dedicated task
//! - [`Message`]: the JSON envelope exchanged with the server
//!
//! # Example
//!
//! ```no_run
//! use catalog_realtime::ws::config::Config;
//! use catalog_realtime::ws::{ConnectionManager, Handlers};
//!
//! # async fn example() -> catalog_realtime::Result<()> {
//! let connection = ConnectionManager::new(Config::builder().url("wss://example.com/live").build());
//! connection.set_handlers(Handlers::new().on_reconnect_failed(|| eprintln!("offline")));
//! connection.connect().await?;
//!
//! // Status indicators can poll instead of relying on callbacks
//! let stats = connection.stats();
//! println!("{} ({} queued)", stats.state, stats.queued_messages);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod message;
pub(crate) mod queue;

pub use connection::{ConnectionManager, ConnectionState, Stats};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use handlers::Handlers;
pub use message::{Message, MessageRequest};
