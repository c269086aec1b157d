//! Realtime channel controller.
//!
//! Owns a reconnecting duplex transport and the ordered message list. Sends are
//! recorded optimistically and delivered over the live transport when it is
//! up, or through the REST fallback otherwise. Every state change is published
//! on a broadcast channel while the state lock is held, so subscribers observe
//! events in the order they were recognized.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use shared::{
    domain::{ChannelConnection, ChannelId, MessageKind, MessageStatus, UserId},
    error::{SyncError, SyncFailure},
    protocol::{
        HistoryResponse, InboundFrame, Message, Metadata, OutboundFrame, SendMessageRequest,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::SyncSettings,
    credentials::CredentialProvider,
    fence::{FenceToken, FetchOutcome, RequestFence},
    http::HttpMessageApi,
    ledger::{Ingested, MessageLedger},
    supervisor::{ReconnectSupervisor, RetryState, Transition},
    transport::{ChannelTransport, WebSocketTransport},
};

/// Request/response side of a channel: history pages and the send fallback.
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// One history page, newest first.
    async fn history(&self, limit: u32, before: Option<&str>)
        -> Result<HistoryResponse, SyncError>;
    async fn send(&self, payload: &SendMessageRequest) -> Result<Message, SyncError>;
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub ws_url: Url,
    pub history_limit: u32,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub auto_connect: bool,
}

impl ChannelConfig {
    pub fn new(channel_id: impl Into<ChannelId>, user_id: impl Into<UserId>, ws_url: Url) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            ws_url,
            history_limit: 50,
            reconnect_interval: Duration::from_millis(3000),
            max_reconnect_attempts: 5,
            auto_connect: true,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self, SyncError> {
        let ws_url = Url::parse(&settings.ws_url)
            .map_err(|err| SyncError::Config(format!("invalid ws_url {}: {err}", settings.ws_url)))?;
        Ok(Self {
            history_limit: settings.history_limit.max(1),
            reconnect_interval: Duration::from_millis(settings.reconnect_interval_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            auto_connect: settings.auto_connect,
            ..Self::new(settings.channel_id.as_str(), settings.user_id.as_str(), ws_url)
        })
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StatusChanged(ChannelConnection),
    Connected,
    /// The transport went away. `will_retry` is false for an explicit
    /// disconnect and when the retry budget is spent.
    Disconnected { will_retry: bool, attempt: u32 },
    /// A local send was recorded and is visible as `Sending`.
    MessageQueued(Message),
    /// A local send was confirmed by the server, replaced in place.
    MessageSent(Message),
    MessageReceived(Message),
    MessageUpdated(Message),
    HistoryLoaded { added: usize, has_more: bool },
    /// A frame with a tag this controller does not interpret.
    Frame(Value),
    Error(SyncFailure),
}

struct ChannelState {
    supervisor: ReconnectSupervisor,
    ledger: MessageLedger,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    history_has_more: bool,
    history_loading: bool,
    /// Fallback sends in flight.
    sending: usize,
    /// Client ids handed to the live transport and not confirmed yet.
    on_socket: HashSet<String>,
    error: Option<SyncFailure>,
}

pub struct RealtimeChannel {
    config: ChannelConfig,
    transport: Arc<dyn ChannelTransport>,
    api: Arc<dyn MessageApi>,
    credentials: Arc<dyn CredentialProvider>,
    /// One generation per transport attempt; a disconnect invalidates all.
    connection: RequestFence,
    history: RequestFence,
    inner: Mutex<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl RealtimeChannel {
    pub fn new(
        config: ChannelConfig,
        transport: Arc<dyn ChannelTransport>,
        api: Arc<dyn MessageApi>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let supervisor =
            ReconnectSupervisor::new(config.max_reconnect_attempts, config.reconnect_interval);
        Arc::new(Self {
            config,
            transport,
            api,
            credentials,
            connection: RequestFence::new(),
            history: RequestFence::new(),
            inner: Mutex::new(ChannelState {
                supervisor,
                ledger: MessageLedger::new(),
                outbound: None,
                reader: None,
                retry_timer: None,
                history_has_more: false,
                history_loading: false,
                sending: 0,
                on_socket: HashSet::new(),
                error: None,
            }),
            events,
        })
    }

    /// Websocket transport plus the REST message API rooted at `api_url`.
    pub fn over_network(
        config: ChannelConfig,
        api_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Arc<Self> {
        let api = HttpMessageApi::new(api_url, Arc::clone(&credentials));
        Self::new(
            config,
            Arc::new(WebSocketTransport),
            Arc::new(api),
            credentials,
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub async fn connection_state(&self) -> ChannelConnection {
        self.inner.lock().await.supervisor.state()
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ChannelConnection::Connected
    }

    pub async fn retry_state(&self) -> RetryState {
        self.inner.lock().await.supervisor.retry()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.ledger.messages().to_vec()
    }

    pub async fn is_sending(&self) -> bool {
        self.inner.lock().await.sending > 0
    }

    pub async fn history_has_more(&self) -> bool {
        self.inner.lock().await.history_has_more
    }

    pub async fn is_loading_history(&self) -> bool {
        self.inner.lock().await.history_loading
    }

    pub async fn error(&self) -> Option<SyncFailure> {
        self.inner.lock().await.error.clone()
    }

    /// Connects and loads the newest history when `auto_connect` is set.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        if !self.config.auto_connect {
            return Ok(());
        }
        self.connect().await;
        self.load_history().await.map(|_| ())
    }

    /// Starts connecting in the background. Returns immediately; progress is
    /// reported through events.
    pub async fn connect(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        if state.supervisor.connect() != Transition::Open {
            return;
        }
        state.error = None;
        self.emit_status(&state);
        let token = self.connection.begin();
        state.reader = Some(spawn_connection(Arc::clone(self), token));
    }

    pub async fn disconnect(&self) {
        let mut state = self.inner.lock().await;
        if state.supervisor.disconnect() != Transition::Closed {
            return;
        }
        self.connection.invalidate_all();
        state.outbound = None;
        self.fail_socket_sends(&mut state);
        if let Some(timer) = state.retry_timer.take() {
            timer.abort();
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        self.emit_status(&state);
        let _ = self.events.send(ChannelEvent::Disconnected {
            will_retry: false,
            attempt: state.supervisor.attempt(),
        });
    }

    /// Records the message optimistically and hands it to the transport, or to
    /// the REST fallback when the transport is not connected. Never waits for
    /// delivery.
    pub async fn send(
        self: &Arc<Self>,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: Option<Metadata>,
    ) -> Result<Message, SyncError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(SyncError::Validation("message content is empty".into()));
        }
        let client_id = Uuid::new_v4().to_string();
        let draft = Message {
            id: String::new(),
            client_id: None,
            content,
            sender_id: self.config.user_id.clone(),
            timestamp: Utc::now(),
            status: MessageStatus::Sending,
            kind,
            metadata,
        };

        let mut state = self.inner.lock().await;
        let recorded = state.ledger.record_optimistic(client_id, draft).clone();
        let _ = self.events.send(ChannelEvent::MessageQueued(recorded.clone()));
        self.deliver(&mut state, &recorded);
        Ok(recorded)
    }

    /// Re-delivers a message whose previous attempt failed.
    pub async fn resend(self: &Arc<Self>, client_id: &str) -> Result<Message, SyncError> {
        let mut state = self.inner.lock().await;
        let Some(message) = state.ledger.mark_resending(client_id) else {
            return Err(SyncError::Validation(format!(
                "no failed message with client id {client_id}"
            )));
        };
        let _ = self
            .events
            .send(ChannelEvent::MessageUpdated(message.clone()));
        self.deliver(&mut state, &message);
        Ok(message)
    }

    pub async fn remove_message(&self, id: &str) -> Option<Message> {
        let mut state = self.inner.lock().await;
        let removed = state.ledger.remove(id)?;
        if let Some(client_id) = &removed.client_id {
            state.on_socket.remove(client_id);
        }
        Some(removed)
    }

    /// Sends a read receipt. Local status is left alone until the server echoes
    /// a status frame.
    pub async fn mark_as_read(&self, message_id: &str) -> Result<(), SyncError> {
        let state = self.inner.lock().await;
        let outbound = match (&state.outbound, state.supervisor.state()) {
            (Some(outbound), ChannelConnection::Connected) => outbound,
            _ => return Err(SyncError::NotConnected),
        };
        let frame = OutboundFrame::Read {
            channel_id: self.config.channel_id.clone(),
            message_id: message_id.to_string(),
        }
        .encode()?;
        outbound.send(frame).map_err(|_| SyncError::NotConnected)
    }

    /// Loads the newest history page, replacing what is shown. Supersedes any
    /// older-page load in flight.
    pub async fn load_history(&self) -> Result<FetchOutcome, SyncError> {
        let token = self.history.begin();
        self.inner.lock().await.history_loading = true;
        let result = self.api.history(self.config.history_limit, None).await;
        self.apply_history(token, result, false).await
    }

    /// Loads the page before the oldest confirmed message.
    pub async fn load_older(&self) -> Result<FetchOutcome, SyncError> {
        let (token, before) = {
            let mut state = self.inner.lock().await;
            if state.history_loading || !state.history_has_more {
                return Ok(FetchOutcome::Skipped);
            }
            let Some(before) = state.ledger.oldest_confirmed_id().map(str::to_string) else {
                return Ok(FetchOutcome::Skipped);
            };
            state.history_loading = true;
            (self.history.current(), before)
        };
        let result = self
            .api
            .history(self.config.history_limit, Some(&before))
            .await;
        self.apply_history(token, result, true).await
    }

    async fn apply_history(
        &self,
        token: FenceToken,
        result: Result<HistoryResponse, SyncError>,
        older: bool,
    ) -> Result<FetchOutcome, SyncError> {
        let mut state = self.inner.lock().await;
        if !self.history.is_current(token) {
            debug!(generation = token.generation(), "discarding stale history page");
            return Ok(FetchOutcome::Discarded);
        }
        state.history_loading = false;
        match result {
            Ok(page) => {
                let mut messages = page.messages;
                messages.reverse();
                let added = if older {
                    state.ledger.prepend_history(messages)
                } else {
                    let count = messages.len();
                    state.ledger.replace_history(messages);
                    count
                };
                state.history_has_more = page.has_more;
                let _ = self.events.send(ChannelEvent::HistoryLoaded {
                    added,
                    has_more: page.has_more,
                });
                Ok(FetchOutcome::Applied)
            }
            Err(err) => {
                warn!(%err, "history fetch failed");
                self.record_error(&mut state, &err);
                Err(err)
            }
        }
    }

    /// Dispatches one inbound text frame. Malformed frames are logged and
    /// dropped; the connection stays up.
    pub async fn handle_frame(&self, text: &str) {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "ignoring malformed frame");
                return;
            }
        };

        let mut state = self.inner.lock().await;
        match frame {
            InboundFrame::Message(message) => {
                let id = message.id.clone();
                let client_id = message.client_id.clone();
                match state.ledger.ingest(message) {
                    Ingested::Appended => {
                        if let Some(received) = state.ledger.get(&id).cloned() {
                            let _ = self.events.send(ChannelEvent::MessageReceived(received));
                        }
                    }
                    Ingested::Confirmed => {
                        if let Some(client_id) = &client_id {
                            state.on_socket.remove(client_id);
                        }
                        if let Some(sent) = state.ledger.get(&id).cloned() {
                            let _ = self.events.send(ChannelEvent::MessageSent(sent));
                        }
                    }
                    Ingested::Duplicate => {}
                }
            }
            InboundFrame::Status { message_id, status } => {
                if let Some(updated) = state.ledger.update_status(&message_id, status).cloned() {
                    let _ = self.events.send(ChannelEvent::MessageUpdated(updated));
                }
            }
            InboundFrame::Typing(value) | InboundFrame::Unknown(value) => {
                let _ = self.events.send(ChannelEvent::Frame(value));
            }
        }
    }

    fn deliver(self: &Arc<Self>, state: &mut ChannelState, message: &Message) {
        let Some(client_id) = message.client_id.clone() else {
            return;
        };

        if state.supervisor.state() == ChannelConnection::Connected {
            if let Some(outbound) = &state.outbound {
                let frame = OutboundFrame::Message {
                    channel_id: self.config.channel_id.clone(),
                    client_id: client_id.clone(),
                    content: message.content.clone(),
                    message_type: message.kind,
                    metadata: message.metadata.clone(),
                };
                match frame.encode() {
                    Ok(text) => match outbound.send(text) {
                        Ok(()) => {
                            state.on_socket.insert(client_id);
                            return;
                        }
                        Err(_) => debug!(%client_id, "transport closed, using fallback send"),
                    },
                    Err(err) => warn!(%err, %client_id, "failed to encode message frame"),
                }
            }
        }

        state.sending += 1;
        let payload = SendMessageRequest {
            content: message.content.clone(),
            kind: message.kind,
            metadata: message.metadata.clone(),
        };
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let result = channel.api.send(&payload).await;
            channel.finish_fallback(&client_id, result).await;
        });
    }

    async fn finish_fallback(&self, client_id: &str, result: Result<Message, SyncError>) {
        let mut state = self.inner.lock().await;
        state.sending = state.sending.saturating_sub(1);
        match result {
            Ok(server) => {
                if let Some(sent) = state.ledger.confirm(client_id, server).cloned() {
                    let _ = self.events.send(ChannelEvent::MessageSent(sent));
                }
            }
            Err(err) => {
                warn!(%err, client_id, "fallback send failed");
                if let Some(failed) = state.ledger.mark_failed(client_id).cloned() {
                    let _ = self.events.send(ChannelEvent::MessageUpdated(failed));
                }
                self.record_error(&mut state, &err);
            }
        }
    }

    async fn connection_url(&self) -> Url {
        let mut url = self.config.ws_url.clone();
        if let Some(token) = self.credentials.bearer_token().await {
            url.query_pairs_mut()
                .append_pair("token", &token)
                .append_pair("channelId", self.config.channel_id.as_str())
                .append_pair("userId", self.config.user_id.as_str());
        }
        url
    }

    async fn run_connection(self: Arc<Self>, token: FenceToken) {
        let url = self.connection_url().await;
        let opened = self.transport.open(&url).await;

        let mut inbound = {
            let mut state = self.inner.lock().await;
            if !self.connection.is_current(token) {
                return;
            }
            match opened {
                Ok(connection) => {
                    if state.supervisor.on_open() != Transition::Opened {
                        return;
                    }
                    state.outbound = Some(connection.outbound);
                    state.error = None;
                    info!(channel_id = %self.config.channel_id, "channel connected");
                    self.emit_status(&state);
                    let _ = self.events.send(ChannelEvent::Connected);
                    connection.inbound
                }
                Err(err) => {
                    self.transport_failed(&mut state, token, Some(err));
                    return;
                }
            }
        };

        while let Some(frame) = inbound.next().await {
            if !self.connection.is_current(token) {
                return;
            }
            match frame {
                Ok(text) => self.handle_frame(&text).await,
                Err(err) => {
                    let mut state = self.inner.lock().await;
                    self.transport_failed(&mut state, token, Some(err));
                    return;
                }
            }
        }

        let mut state = self.inner.lock().await;
        self.transport_failed(&mut state, token, None);
    }

    fn transport_failed(
        self: &Arc<Self>,
        state: &mut ChannelState,
        token: FenceToken,
        err: Option<SyncError>,
    ) {
        if !self.connection.is_current(token) {
            return;
        }
        state.outbound = None;
        self.fail_socket_sends(state);
        match &err {
            Some(err) => warn!(%err, attempt = state.supervisor.attempt(), "channel transport failed"),
            None => info!(attempt = state.supervisor.attempt(), "channel transport closed"),
        }
        if let Some(err) = &err {
            state.error = Some(SyncFailure::from(err));
        }

        match state.supervisor.on_failure() {
            Transition::RetryAfter(delay) => {
                self.emit_status(state);
                let _ = self.events.send(ChannelEvent::Disconnected {
                    will_retry: true,
                    attempt: state.supervisor.attempt(),
                });
                state.retry_timer = Some(schedule_retry(Arc::clone(self), token, delay));
            }
            Transition::GaveUp { attempts } => {
                self.emit_status(state);
                let _ = self.events.send(ChannelEvent::Disconnected {
                    will_retry: false,
                    attempt: attempts,
                });
                self.record_error(state, &SyncError::CapacityExceeded { attempts });
            }
            _ => {}
        }
    }

    async fn retry_elapsed(self: &Arc<Self>, token: FenceToken) {
        let mut state = self.inner.lock().await;
        if !self.connection.is_current(token) {
            return;
        }
        state.retry_timer = None;
        if state.supervisor.on_retry_elapsed() != Transition::Open {
            return;
        }
        self.emit_status(&state);
        let next = self.connection.begin();
        state.reader = Some(spawn_connection(Arc::clone(self), next));
    }

    /// Sends queued on a transport that went away will not be confirmed; they
    /// become failed and can be resent.
    fn fail_socket_sends(&self, state: &mut ChannelState) {
        for client_id in std::mem::take(&mut state.on_socket) {
            if let Some(failed) = state.ledger.mark_failed(&client_id).cloned() {
                debug!(%client_id, "send lost with the transport");
                let _ = self.events.send(ChannelEvent::MessageUpdated(failed));
            }
        }
    }

    fn emit_status(&self, state: &ChannelState) {
        let _ = self
            .events
            .send(ChannelEvent::StatusChanged(state.supervisor.state()));
    }

    fn record_error(&self, state: &mut ChannelState, err: &SyncError) {
        let failure = SyncFailure::from(err);
        state.error = Some(failure.clone());
        let _ = self.events.send(ChannelEvent::Error(failure));
    }
}

fn spawn_connection(channel: Arc<RealtimeChannel>, token: FenceToken) -> JoinHandle<()> {
    tokio::spawn(channel.run_connection(token))
}

fn schedule_retry(
    channel: Arc<RealtimeChannel>,
    token: FenceToken,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        channel.retry_elapsed(token).await;
    })
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
