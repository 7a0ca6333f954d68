//! Client Session
//!
//! One per downstream connection. Applies parsed requests to the registry
//! and keeps a shadow set of the session's streams for limit checks. The
//! registry reaches the session through a [`ChannelSink`] wrapping the
//! session's bounded outbound queue; a full queue drops frames for this
//! session only. Error notices travel on a separate unbounded queue so a
//! backed-up client still learns that the feed is gone.
//!
//! Closing is idempotent and also runs on drop, so every exit path of the
//! connection task releases the session's registry state exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::protocol::{ClientRequest, RequestError, ServerFrame, validate_streams};
use crate::application::ports::{Authenticator, SessionSink};
use crate::application::services::StreamRegistry;
use crate::domain::streaming::{StreamFrame, StreamId, SubscriberId};
use crate::infrastructure::metrics;

/// An item on a session's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Market data.
    Data(Arc<StreamFrame>),
    /// Response or notice.
    Frame(ServerFrame),
    /// Heartbeat ping.
    Ping,
}

/// Receiving ends of a session's outbound paths.
#[derive(Debug)]
pub struct OutboundQueues {
    /// Bounded queue of data, replies and pings.
    pub frames: mpsc::Receiver<Outbound>,
    /// Unbounded error notices, drained ahead of `frames`.
    pub notices: mpsc::UnboundedReceiver<ServerFrame>,
}

/// [`SessionSink`] over a bounded data channel and an unbounded notice
/// channel. Never blocks.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Outbound>,
    notices: mpsc::UnboundedSender<ServerFrame>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Wrap the data and notice senders.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<Outbound>, notices: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            tx,
            notices,
            dropped: AtomicU64::new(0),
        }
    }

    /// Frames dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn offer(&self, item: Outbound) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_frames_dropped(1);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl SessionSink for ChannelSink {
    fn deliver(&self, frame: Arc<StreamFrame>) -> bool {
        self.offer(Outbound::Data(frame))
    }

    fn notify_error(&self, message: &str) -> bool {
        self.notices.send(ServerFrame::error(message)).is_ok()
    }
}

/// Session state for one downstream client.
pub struct ClientSession {
    id: SubscriberId,
    registry: Arc<StreamRegistry>,
    authenticator: Arc<dyn Authenticator>,
    streams: HashSet<StreamId>,
    max_streams: usize,
    authenticated: bool,
    closed: bool,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("streams", &self.streams.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Register a new session with the registry.
    ///
    /// Returns the session, a sender for replies and the receiving ends of
    /// its outbound queues.
    #[must_use]
    pub fn open(
        registry: Arc<StreamRegistry>,
        authenticator: Arc<dyn Authenticator>,
        max_streams: usize,
        buffer: usize,
    ) -> (Self, mpsc::Sender<Outbound>, OutboundQueues) {
        let (tx, frames) = mpsc::channel(buffer.max(1));
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let id = registry.register(Arc::new(ChannelSink::new(tx.clone(), notices_tx)));
        let authenticated = !authenticator.required();
        tracing::info!(subscriber_id = id, "Client session opened");

        let session = Self {
            id,
            registry,
            authenticator,
            streams: HashSet::new(),
            max_streams,
            authenticated,
            closed: false,
        };
        (session, tx, OutboundQueues { frames, notices })
    }

    /// Subscriber id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Streams held by this session, sorted.
    #[must_use]
    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<_> = self.streams.iter().cloned().collect();
        streams.sort();
        streams
    }

    /// Parse and apply request text, returning the reply frame.
    pub fn handle_text(&mut self, text: &str) -> ServerFrame {
        self.reply(ClientRequest::from_text(text))
    }

    /// Apply an already decoded request value, returning the reply frame.
    pub fn handle_value(&mut self, value: Value) -> ServerFrame {
        self.reply(ClientRequest::from_value(value))
    }

    fn reply(&mut self, parsed: Result<ClientRequest, RequestError>) -> ServerFrame {
        match parsed.and_then(|request| self.handle_request(request)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(subscriber_id = self.id, error = %e, "Rejected client request");
                metrics::record_protocol_error(metrics::Side::Downstream);
                e.into()
            }
        }
    }

    /// Apply one request.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] to be reported to this client only.
    pub fn handle_request(&mut self, request: ClientRequest) -> Result<ServerFrame, RequestError> {
        match request {
            ClientRequest::Subscribe { params, id } => {
                if !self.authenticated {
                    return Err(RequestError::Unauthenticated);
                }
                let streams = validate_streams(&params)?;
                let added = streams.iter().filter(|s| !self.streams.contains(*s)).count();
                if self.streams.len() + added > self.max_streams {
                    return Err(RequestError::TooManyStreams {
                        limit: self.max_streams,
                    });
                }
                self.registry.subscribe(self.id, &streams);
                self.streams.extend(streams);
                Ok(ServerFrame::ack(id))
            }
            ClientRequest::Unsubscribe { params, id } => {
                let streams = validate_streams(&params)?;
                self.registry.unsubscribe(self.id, &streams);
                for stream in &streams {
                    self.streams.remove(stream);
                }
                Ok(ServerFrame::ack(id))
            }
            ClientRequest::ListSubscriptions { id } => {
                let streams = self.registry.subscriber_streams(self.id);
                Ok(ServerFrame::result(Value::from(streams), id))
            }
            ClientRequest::Ping { id } => Ok(ServerFrame::result(Value::from("pong"), id)),
            ClientRequest::Auth { params, token, id } => {
                let token = token
                    .or_else(|| params.into_iter().next())
                    .ok_or(RequestError::MissingToken)?;
                self.authenticator.authenticate(&token)?;
                self.authenticated = true;
                tracing::debug!(subscriber_id = self.id, "Client authenticated");
                Ok(ServerFrame::ack(id))
            }
        }
    }

    /// Release all registry state. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let released = self.registry.remove_subscriber(self.id);
        self.streams.clear();
        tracing::info!(
            subscriber_id = self.id,
            released = released.len(),
            "Client session closed"
        );
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
