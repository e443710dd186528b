//! Caller callbacks and the task that delivers them.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use super::message::Message;
use crate::error::Error;

type Callback = Arc<dyn Fn() + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
type ReconnectCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Optional callbacks for connection events.
///
/// Registering a new set with [`set_handlers`](super::ConnectionManager::set_handlers)
/// replaces the previous one. Callbacks run one at a time, in the order the events
/// happened, on a dedicated task. They may call back into the manager.
///
/// ```
/// use catalog_realtime::ws::Handlers;
///
/// let handlers = Handlers::new()
///     .on_open(|| println!("live"))
///     .on_message(|message| println!("{}: {}", message.kind, message.payload))
///     .on_reconnect(|attempt| println!("reconnecting, attempt {attempt}"))
///     .on_reconnect_failed(|| println!("giving up"));
/// ```
#[derive(Clone, Default)]
pub struct Handlers {
    on_open: Option<Callback>,
    on_message: Option<MessageCallback>,
    on_close: Option<Callback>,
    on_error: Option<ErrorCallback>,
    on_reconnect: Option<ReconnectCallback>,
    on_reconnect_failed: Option<Callback>,
}

impl Handlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The socket opened, after an explicit connect or a successful retry.
    #[must_use]
    pub fn on_open<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_message<F: Fn(&Message) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// An open socket closed, for any reason.
    #[must_use]
    pub fn on_close<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error<F: Fn(&Error) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// A reconnection attempt is starting. Attempts are numbered from 1.
    #[must_use]
    pub fn on_reconnect<F: Fn(u32) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_reconnect = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_reconnect_failed<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_reconnect_failed = Some(Arc::new(f));
        self
    }

    fn dispatch(&self, event: &Event) {
        match event {
            Event::Open => call(self.on_open.as_deref()),
            Event::Message(message) => {
                if let Some(f) = &self.on_message {
                    f(message);
                }
            }
            Event::Close => call(self.on_close.as_deref()),
            Event::Error(error) => {
                if let Some(f) = &self.on_error {
                    f(error);
                }
            }
            Event::Reconnect(attempt) => {
                if let Some(f) = &self.on_reconnect {
                    f(*attempt);
                }
            }
            Event::ReconnectFailed => call(self.on_reconnect_failed.as_deref()),
        }
    }
}

fn call(callback: Option<&(dyn Fn() + Send + Sync)>) {
    if let Some(f) = callback {
        f();
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_reconnect", &self.on_reconnect.is_some())
            .field("on_reconnect_failed", &self.on_reconnect_failed.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    Open,
    Message(Message),
    Close,
    Error(Error),
    Reconnect(u32),
    ReconnectFailed,
}

/// Deliver events to whichever handler set is registered when each event is processed.
///
/// A panicking callback loses only the event it was handling. Ends once every event sender
/// is gone.
pub(crate) async fn dispatch_loop(
    handlers: Arc<RwLock<Handlers>>,
    mut events_rx: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events_rx.recv().await {
        // Clone out so callbacks never run under the lock and may replace the set themselves.
        let current = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        #[cfg(feature = "tracing")]
        tracing::trace!(?event, "Dispatching connection event");

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| current.dispatch(&event))) {
            #[cfg(feature = "tracing")]
            tracing::error!(
                ?event,
                panic = panic_message(panic.as_ref()),
                "Connection event handler panicked"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = &panic;
        }
    }
}

#[cfg(feature = "tracing")]
fn panic_message(panic: &(dyn std::any::Any + Send + 'static)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
