//! Async session client.
//!
//! [`SessionClient`] is a cheap, cloneable handle to a session actor: one
//! tokio task that owns the [`Session`] and processes commands and link
//! events one at a time.
//!
//! ```text
//!  handle ── Command ──►┌──────────────┐◄── LinkEvent ── reader task ◄── WebSocket
//!  handle ── Command ──►│ session actor│
//!                       │  (Session)   │── WsChannel ──► writer task ──► WebSocket
//!                       └──────┬───────┘
//!                              └── watch<ConnectionState>, presence broadcast
//! ```
//!
//! Each link carries a generation number so events from a link torn down
//! by a disconnect are ignored.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::channel::WsChannel;
use crate::connection::ConnectionState;
use crate::correlator::{RespondableHandlers, RespondableRequest, ResponseFuture, ResponseGuard};
use crate::dispatcher::EventDispatcher;
use crate::presence::{PresenceChange, RemoteUser};
use crate::protocol::SelfIdentity;
use crate::restore::ReplicatedState;
use crate::session::{Session, SessionConfig, SessionError, SessionStats};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL
    pub server_url: String,
    pub session: SessionConfig,
    /// Frames buffered for the writer task before sends report `Full`
    pub outgoing_capacity: usize,
    pub command_capacity: usize,
    /// Frames buffered between the reader task and the actor
    pub inbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            session: SessionConfig::default(),
            outgoing_capacity: 256,
            command_capacity: 64,
            inbound_capacity: 256,
        }
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub room_id: Option<String>,
    pub local_user: Option<SelfIdentity>,
    pub users: Vec<RemoteUser>,
    pub pending_requests: usize,
    pub backlog: usize,
    pub stats: SessionStats,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Host { room_id: String, reply: Reply<()> },
    Join { room_id: String, reply: Reply<()> },
    Disconnect { reply: Reply<bool> },
    Respondable(RespondableRequest),
    Send { event: String, payload: Value, reply: Reply<bool> },
    PublishSnapshot { reply: Reply<bool> },
    RegisterReplica { replica: Arc<dyn ReplicatedState>, reply: Reply<()> },
    Status { reply: Reply<SessionStatus> },
    Shutdown,
}

enum LinkEvent {
    Opened { generation: u64, outgoing: mpsc::Sender<String> },
    Frame { generation: u64, text: String },
    Failed { generation: u64, reason: String },
    Closed { generation: u64 },
}

impl LinkEvent {
    fn generation(&self) -> u64 {
        match self {
            Self::Opened { generation, .. }
            | Self::Frame { generation, .. }
            | Self::Failed { generation, .. }
            | Self::Closed { generation } => *generation,
        }
    }
}

/// Handle to a running session actor.
#[derive(Clone)]
pub struct SessionClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: EventDispatcher,
    presence: broadcast::Sender<PresenceChange>,
}

impl SessionClient {
    /// Start the session actor. Must be called inside a tokio runtime.
    pub fn spawn(config: ClientConfig) -> Self {
        let dispatcher: EventDispatcher = EventDispatcher::new();
        let session = Session::with_dispatcher(config.session.clone(), dispatcher.clone());
        let presence = session.presence().change_sender();

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (link_tx, link_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(session.state());

        let actor = Actor {
            config,
            session,
            state_tx,
            link_tx,
            generation: 0,
            link: None,
        };
        tokio::spawn(actor.run(command_rx, link_rx));

        Self {
            commands: command_tx,
            state: state_rx,
            dispatcher,
            presence,
        }
    }

    /// Handler registry shared with the actor. Handlers run on the actor task.
    pub fn dispatcher(&self) -> EventDispatcher {
        self.dispatcher.clone()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(timeout, async {
            state.wait_for(|s| *s == target).await.map(|_| ())
        })
        .await;
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::Stopped),
            Err(_) => Err(SessionError::Timeout(target)),
        }
    }

    /// Host a room under a freshly generated id and return the id.
    pub async fn host_room(&self) -> Result<String, SessionError> {
        let room_id = Uuid::new_v4().to_string();
        self.host_room_with_id(room_id.clone()).await?;
        Ok(room_id)
    }

    pub async fn host_room_with_id(&self, room_id: impl Into<String>) -> Result<(), SessionError> {
        let room_id = room_id.into();
        self.request(|reply| Command::Host { room_id, reply }).await
    }

    pub async fn join_room(&self, room_id: impl Into<String>) -> Result<(), SessionError> {
        let room_id = room_id.into();
        self.request(|reply| Command::Join { room_id, reply }).await
    }

    pub async fn disconnect(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Send a respondable request. If the actor has stopped the request
    /// completes through `on_offline`.
    pub async fn send_respondable(&self, mut request: RespondableRequest) -> ResponseFuture {
        let future = request.subscribe();
        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(Command::Respondable(request)).await
        {
            log::debug!("Session stopped; completing request offline");
            drop(command);
        }
        future
    }

    pub async fn send_respondable_message<Req, R>(
        &self,
        event: &str,
        request: &Req,
        guard: ResponseGuard<R>,
        handlers: RespondableHandlers<R>,
    ) -> Result<ResponseFuture, SessionError>
    where
        Req: Serialize + ?Sized,
        R: 'static,
    {
        let request = RespondableRequest::new(event, request, guard, handlers)?;
        Ok(self.send_respondable(request).await)
    }

    /// Fire-and-forget send. `Ok(false)` when not online.
    pub async fn send<P: Serialize + ?Sized>(
        &self,
        event: &str,
        payload: &P,
    ) -> Result<bool, SessionError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| crate::protocol::ProtocolError::SerializationError(e.to_string()))?;
        let event = event.to_string();
        self.request(|reply| Command::Send {
            event,
            payload,
            reply,
        })
        .await
    }

    pub async fn publish_snapshot(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::PublishSnapshot { reply }).await
    }

    pub async fn register_replica(
        &self,
        replica: Arc<dyn ReplicatedState>,
    ) -> Result<(), SessionError> {
        self.request(|reply| Command::RegisterReplica { replica, reply })
            .await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop the actor, going offline first. Resolves once the actor exited.
    pub async fn shutdown(&self) {
        let mut state = self.state.clone();
        if self.commands.send(Command::Shutdown).await.is_ok() {
            while state.changed().await.is_ok() {}
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }
}

struct Actor {
    config: ClientConfig,
    session: Session,
    state_tx: watch::Sender<ConnectionState>,
    link_tx: mpsc::Sender<LinkEvent>,
    generation: u64,
    link: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut links: mpsc::Receiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(link) = links.recv() => {
                    self.handle_link(link);
                    self.settle();
                }
            }
        }

        self.session.disconnect();
        self.settle();
        log::debug!("Session actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Host { room_id, reply } => {
                let result = self.session.host_room(room_id);
                self.after_begin(result, reply);
            }
            Command::Join { room_id, reply } => {
                let result = self.session.join_room(room_id);
                self.after_begin(result, reply);
            }
            Command::Disconnect { reply } => {
                let left = self.session.disconnect();
                self.settle();
                let _ = reply.send(Ok(left));
            }
            Command::Respondable(request) => {
                self.session.submit_respondable(request);
                self.settle();
            }
            Command::Send {
                event,
                payload,
                reply,
            } => {
                let result = self.session.send(&event, &payload);
                let _ = reply.send(result);
            }
            Command::PublishSnapshot { reply } => {
                let _ = reply.send(self.session.publish_snapshot());
            }
            Command::RegisterReplica { replica, reply } => {
                let _ = reply.send(self.session.register_replica(replica));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Command::Shutdown => {}
        }
    }

    fn after_begin(&mut self, result: Result<(), SessionError>, reply: Reply<()>) {
        if result.is_ok() {
            self.open_link();
        }
        self.settle();
        let _ = reply.send(result);
    }

    fn open_link(&mut self) {
        self.generation += 1;
        let link = run_link(
            self.generation,
            self.config.server_url.clone(),
            self.config.outgoing_capacity.max(1),
            self.link_tx.clone(),
        );
        self.link = Some(tokio::spawn(link));
    }

    fn handle_link(&mut self, event: LinkEvent) {
        if event.generation() != self.generation {
            log::debug!("Ignoring event from stale link {}", event.generation());
            return;
        }
        match event {
            LinkEvent::Opened { outgoing, .. } => {
                if let Err(e) = self.session.attach_channel(Box::new(WsChannel::new(outgoing))) {
                    log::warn!("Could not attach link: {e}");
                }
            }
            LinkEvent::Frame { text, .. } => self.session.handle_frame(&text),
            LinkEvent::Failed { reason, .. } => {
                self.link = None;
                self.session.connect_failed(&reason);
            }
            LinkEvent::Closed { .. } => {
                self.link = None;
                self.session.channel_closed();
            }
        }
    }

    /// Tear down the link once the session is offline, then publish state.
    fn settle(&mut self) {
        if self.session.state().is_offline() {
            if let Some(link) = self.link.take() {
                link.abort();
                self.generation += 1;
            }
        }
        self.state_tx.send_replace(self.session.state());
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.session.state(),
            room_id: self.session.room_id().map(str::to_string),
            local_user: self.session.local_user().cloned(),
            users: self.session.presence().sorted_users(),
            pending_requests: self.session.pending_requests(),
            backlog: self.session.backlog_len(),
            stats: self.session.stats().clone(),
        }
    }
}

/// Own one WebSocket connection: report it opened, forward text frames,
/// and report when it ends.
async fn run_link(
    generation: u64,
    url: String,
    outgoing_capacity: usize,
    events: mpsc::Sender<LinkEvent>,
) {
    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let _ = events
                .send(LinkEvent::Failed {
                    generation,
                    reason: format!("{url}: {e}"),
                })
                .await;
            return;
        }
    };
    log::debug!("Link {generation} connected to {url}");

    let (mut sink, mut source) = stream.split();
    let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(outgoing_capacity);
    if events
        .send(LinkEvent::Opened {
            generation,
            outgoing,
        })
        .await
        .is_err()
    {
        return;
    }

    // Ends when the session drops its WsChannel.
    let writer = tokio::spawn(async move {
        while let Some(text) = outgoing_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                log::warn!("Link {generation} write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame = LinkEvent::Frame {
                    generation,
                    text: text.as_str().to_owned(),
                };
                if events.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("Link {generation} read failed: {e}");
                break;
            }
        }
    }

    writer.abort();
    let _ = events.send(LinkEvent::Closed { generation }).await;
}
