//! Transport driver for [`ClientCore`]: executes its actions over a
//! WebSocket session, falling back to HTTP long-poll permanently when the
//! WebSocket upgrade is refused at the HTTP level (intercepting proxies).

use std::collections::VecDeque;
use std::future::{self, Future};
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pylon_protocol::{Command, Delivery, Reply};

use crate::backoff::Backoff;
use crate::error::{ClientError, Result};
use crate::state::{ClientAction, ClientCore, ClientEvent};

/// Which transport the driver may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Prefer WebSocket, fall back to long-poll if the upgrade is refused.
    Auto,
    WebSocket,
    LongPoll,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:15100/ws`.
    pub ws_url: String,
    /// HTTP base for long-poll and health, e.g. `http://127.0.0.1:15100`.
    pub http_url: String,
    pub channels: Vec<String>,
    pub transport: TransportMode,
    pub backoff: Backoff,
    /// Delay between the page becoming visible and the reconnect attempt.
    pub resume_debounce: Duration,
}

impl ClientConfig {
    pub fn new(ws_url: impl Into<String>, http_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            http_url: http_url.into(),
            channels: Vec::new(),
            transport: TransportMode::Auto,
            backoff: Backoff::default(),
            resume_debounce: Duration::from_millis(200),
        }
    }

    pub fn channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn transport(mut self, transport: TransportMode) -> Self {
        self.transport = transport;
        self
    }
}

/// Handle to a running client task. Dropping the handle (or the delivery
/// receiver) shuts the task down.
pub struct EventClient {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
}

impl EventClient {
    /// Spawn the driver task. Deliveries arrive on the returned receiver in
    /// increasing-id order per channel.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let core = ClientCore::new(
            config.channels.clone(),
            config.backoff.clone(),
            config.resume_debounce,
        );
        let driver = Driver {
            core,
            http: reqwest::Client::new(),
            config,
            cmd_rx,
            delivery_tx,
            session: None,
            connecting: None,
            timer: None,
            use_longpoll: false,
        };
        tokio::spawn(driver.run());

        (Self { cmd_tx }, delivery_rx)
    }

    /// Replace the subscribed channel set.
    pub fn set_channels(&self, channels: Vec<String>) {
        let _ = self.cmd_tx.send(ClientCommand::SetChannels(channels));
    }

    /// Tear down the transport and stop reconnecting (page hidden).
    pub fn suspend(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Suspend);
    }

    /// Reconnect after the debounce (page shown again).
    pub fn resume(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Resume);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Shutdown);
    }
}

#[derive(Debug)]
enum ClientCommand {
    SetChannels(Vec<String>),
    Suspend,
    Resume,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Retry,
    Resume,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<Session>> + Send>>;

struct ConnectAttempt {
    filter: Vec<String>,
    fut: ConnectFuture,
}

/// Frames arriving on the WebSocket: command replies are tagged on
/// `status`, so they must be tried first.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Reply(Reply),
    Delivery(Delivery),
}

enum SessionEvent {
    Delivery(Delivery),
    Closed,
}

enum Session {
    Ws(WsSession),
    Poll(PollSession),
}

impl Session {
    async fn next_event(&mut self) -> SessionEvent {
        match self {
            Session::Ws(ws) => ws.next_event().await,
            Session::Poll(poll) => poll.next_event().await,
        }
    }

    async fn send_filter(&mut self, filter: Vec<String>) -> Result<()> {
        match self {
            Session::Ws(ws) => ws.send_filter(filter).await,
            Session::Poll(poll) => {
                poll.channels = filter;
                Ok(())
            }
        }
    }
}

struct WsSession {
    stream: WsStream,
    /// Deliveries that raced ahead of a command ack during the handshake.
    buffered: VecDeque<Delivery>,
}

impl WsSession {
    async fn next_event(&mut self) -> SessionEvent {
        if let Some(delivery) = self.buffered.pop_front() {
            return SessionEvent::Delivery(delivery);
        }
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<Inbound>(text.as_str()) {
                        Ok(Inbound::Delivery(delivery)) => {
                            return SessionEvent::Delivery(delivery);
                        }
                        // ack to an in-session set-filter
                        Ok(Inbound::Reply(_)) => continue,
                        Err(err) => {
                            tracing::warn!(error = %err, "unparseable frame, ignoring");
                            continue;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return SessionEvent::Closed,
                // pongs are produced by the library; other frames ignored
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "WebSocket read failed");
                    return SessionEvent::Closed;
                }
            }
        }
    }

    async fn send_filter(&mut self, filter: Vec<String>) -> Result<()> {
        send_command(&mut self.stream, &Command::SetFilter { filter }).await
    }
}

struct PollSession {
    http: reqwest::Client,
    base: String,
    channels: Vec<String>,
    last: u64,
}

impl PollSession {
    async fn next_event(&mut self) -> SessionEvent {
        if self.channels.is_empty() {
            // nothing subscribed; wait until the filter changes
            future::pending::<()>().await;
        }
        loop {
            let url = poll_request_url(&self.base, &self.channels, self.last);
            let resp = match self.http.get(&url).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    tracing::debug!(error = %err, "long-poll request failed");
                    return SessionEvent::Closed;
                }
            };
            match resp.status() {
                StatusCode::OK => match resp.json::<Delivery>().await {
                    Ok(delivery) => {
                        self.last = self.last.max(delivery.id);
                        return SessionEvent::Delivery(delivery);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "malformed long-poll body");
                        return SessionEvent::Closed;
                    }
                },
                // nothing arrived within the window; re-issue
                StatusCode::GATEWAY_TIMEOUT => continue,
                status => {
                    tracing::debug!(%status, "long-poll rejected");
                    return SessionEvent::Closed;
                }
            }
        }
    }
}

fn poll_request_url(base: &str, channels: &[String], last: u64) -> String {
    format!("{}/channels/{}?last={}", base, channels.join("|"), last)
}

struct Driver {
    core: ClientCore,
    config: ClientConfig,
    http: reqwest::Client,
    cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    session: Option<Session>,
    connecting: Option<ConnectAttempt>,
    timer: Option<(TimerKind, Pin<Box<Sleep>>)>,
    /// Set once the WebSocket upgrade is refused; never unset.
    use_longpoll: bool,
}

enum Step {
    Cmd(Option<ClientCommand>),
    Connected(Result<Session>),
    Session(SessionEvent),
    Timer(TimerKind),
}

impl Driver {
    async fn run(mut self) {
        self.use_longpoll = self.config.transport == TransportMode::LongPoll;
        let actions = self.core.start();
        self.apply(actions).await;

        loop {
            let step = tokio::select! {
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                result = await_connect(&mut self.connecting) => Step::Connected(result),
                event = next_session_event(&mut self.session) => Step::Session(event),
                kind = fire_timer(&mut self.timer) => Step::Timer(kind),
            };

            match step {
                Step::Cmd(None) | Step::Cmd(Some(ClientCommand::Shutdown)) => break,
                Step::Cmd(Some(ClientCommand::SetChannels(channels))) => {
                    let actions = self.core.set_channels(channels);
                    self.apply(actions).await;
                }
                Step::Cmd(Some(ClientCommand::Suspend)) => {
                    self.step_core(ClientEvent::Hidden).await;
                }
                Step::Cmd(Some(ClientCommand::Resume)) => {
                    self.step_core(ClientEvent::Shown).await;
                }
                Step::Connected(result) => {
                    let subscribed = match self.connecting.take() {
                        Some(attempt) => attempt.filter,
                        None => Vec::new(),
                    };
                    self.on_connect_result(result, subscribed).await;
                }
                Step::Session(SessionEvent::Delivery(delivery)) => {
                    self.step_core(ClientEvent::Delivered { id: delivery.id }).await;
                    if self.delivery_tx.send(delivery).is_err() {
                        // consumer dropped the receiver
                        break;
                    }
                }
                Step::Session(SessionEvent::Closed) => {
                    self.session = None;
                    self.step_core(ClientEvent::TransportClosed).await;
                }
                Step::Timer(kind) => {
                    self.timer = None;
                    let event = match kind {
                        TimerKind::Retry => ClientEvent::RetryDue,
                        TimerKind::Resume => ClientEvent::ResumeDue,
                    };
                    self.step_core(event).await;
                }
            }
        }

        if let Some(Session::Ws(mut ws)) = self.session.take() {
            let _ = ws.stream.close(None).await;
        }
    }

    async fn on_connect_result(&mut self, result: Result<Session>, subscribed: Vec<String>) {
        match result {
            Ok(session) => {
                self.session = Some(session);
                let mut actions = self.core.handle(ClientEvent::TransportOpen);
                // the filter may have changed while the connect was in flight
                if subscribed.as_slice() != self.core.channels() {
                    actions.push(ClientAction::SendFilter {
                        filter: self.core.channels().to_vec(),
                    });
                }
                self.apply(actions).await;
            }
            Err(err) => {
                if self.config.transport == TransportMode::Auto
                    && !self.use_longpoll
                    && should_fallback(&err)
                {
                    tracing::warn!(error = %err, "WebSocket upgrade refused, switching to long-poll");
                    self.use_longpoll = true;
                } else {
                    tracing::debug!(error = %err, "connect attempt failed");
                }
                self.step_core(ClientEvent::TransportFailed).await;
            }
        }
    }

    async fn step_core(&mut self, event: ClientEvent) {
        let actions = self.core.handle(event);
        self.apply(actions).await;
    }

    async fn apply(&mut self, actions: Vec<ClientAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                ClientAction::OpenTransport { start, filter } => {
                    self.begin_connect(start, filter);
                }
                ClientAction::CloseTransport => {
                    self.connecting = None;
                    self.session = None;
                }
                ClientAction::SendFilter { filter } => {
                    if let Some(session) = self.session.as_mut() {
                        if let Err(err) = session.send_filter(filter).await {
                            tracing::debug!(error = %err, "re-subscribe failed");
                            self.session = None;
                            queue.extend(self.core.handle(ClientEvent::TransportClosed));
                        }
                    }
                }
                ClientAction::ScheduleRetry(delay) => {
                    self.timer = Some((TimerKind::Retry, Box::pin(sleep(delay))));
                }
                ClientAction::ScheduleResume(delay) => {
                    self.timer = Some((TimerKind::Resume, Box::pin(sleep(delay))));
                }
                ClientAction::CancelTimer => {
                    self.timer = None;
                }
            }
        }
    }

    fn begin_connect(&mut self, start: u64, filter: Vec<String>) {
        let fut = connect_and_subscribe(
            self.http.clone(),
            self.config.ws_url.clone(),
            self.config.http_url.clone(),
            self.use_longpoll,
            start,
            filter.clone(),
        );
        self.connecting = Some(ConnectAttempt {
            filter,
            fut: Box::pin(fut),
        });
    }
}

async fn await_connect(connecting: &mut Option<ConnectAttempt>) -> Result<Session> {
    match connecting {
        Some(attempt) => attempt.fut.as_mut().await,
        None => future::pending().await,
    }
}

async fn next_session_event(session: &mut Option<Session>) -> SessionEvent {
    match session {
        Some(session) => session.next_event().await,
        None => future::pending().await,
    }
}

async fn fire_timer(timer: &mut Option<(TimerKind, Pin<Box<Sleep>>)>) -> TimerKind {
    match timer {
        Some((kind, sleep)) => {
            sleep.as_mut().await;
            *kind
        }
        None => future::pending().await,
    }
}

/// Open a transport and complete the subscription handshake. Cancelled (by
/// dropping the future) when the page goes hidden mid-connect.
async fn connect_and_subscribe(
    http: reqwest::Client,
    ws_url: String,
    http_url: String,
    use_longpoll: bool,
    start: u64,
    filter: Vec<String>,
) -> Result<Session> {
    if use_longpoll {
        // probe the server so a dead backend backs off instead of spinning
        http.get(format!("{}/health", http_url))
            .send()
            .await?
            .error_for_status()?;
        return Ok(Session::Poll(PollSession {
            http,
            base: http_url,
            channels: filter,
            last: start,
        }));
    }

    let (mut stream, _resp) = connect_async(ws_url.as_str()).await?;

    // watermark first, so the filter change replays from it
    let mut buffered = VecDeque::new();
    send_command(&mut stream, &Command::StartMsg { start }).await?;
    wait_ack(&mut stream, &mut buffered).await?;
    if !filter.is_empty() {
        send_command(&mut stream, &Command::SetFilter { filter }).await?;
        wait_ack(&mut stream, &mut buffered).await?;
    }

    Ok(Session::Ws(WsSession { stream, buffered }))
}

async fn send_command(stream: &mut WsStream, cmd: &Command) -> Result<()> {
    let json = serde_json::to_string(cmd).map_err(|e| ClientError::Protocol(e.to_string()))?;
    stream.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

/// Read until a command reply arrives, buffering any deliveries that the
/// replay pushes ahead of the ack.
async fn wait_ack(stream: &mut WsStream, buffered: &mut VecDeque<Delivery>) -> Result<()> {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<Inbound>(text.as_str()) {
                    Ok(Inbound::Reply(Reply::Success { .. })) => return Ok(()),
                    Ok(Inbound::Reply(Reply::Error { code, message })) => {
                        return Err(ClientError::Rejected { code, message });
                    }
                    Ok(Inbound::Delivery(delivery)) => buffered.push_back(delivery),
                    Err(err) => return Err(ClientError::Protocol(err.to_string())),
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => return Err(ClientError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

/// An upgrade refused at the HTTP level means an intermediary is stripping
/// WebSocket; retrying it will not help, so switch transports.
fn should_fallback(err: &ClientError) -> bool {
    matches!(err, ClientError::Ws(WsError::Http(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_distinguishes_replies_from_deliveries() {
        let reply: Inbound = serde_json::from_value(json!({"status": "success", "id": 3})).unwrap();
        assert!(matches!(reply, Inbound::Reply(Reply::Success { id: Some(3) })));

        let delivery: Inbound =
            serde_json::from_value(json!({"id": 3, "channel": "chat", "message": {"k": 1}}))
                .unwrap();
        match delivery {
            Inbound::Delivery(d) => {
                assert_eq!(d.id, 3);
                assert_eq!(d.channel, "chat");
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn poll_url_joins_channels_with_pipe() {
        let url = poll_request_url(
            "http://127.0.0.1:15100",
            &["alerts".to_string(), "chat".to_string()],
            42,
        );
        assert_eq!(url, "http://127.0.0.1:15100/channels/alerts|chat?last=42");
    }

    #[test]
    fn fallback_only_on_http_level_refusal() {
        let resp = tokio_tungstenite::tungstenite::http::Response::new(None);
        assert!(should_fallback(&ClientError::Ws(WsError::Http(resp))));
        assert!(!should_fallback(&ClientError::Closed));
        assert!(!should_fallback(&ClientError::Ws(
            WsError::ConnectionClosed
        )));
    }

    #[test]
    fn config_defaults_to_auto_transport() {
        let config = ClientConfig::new("ws://h/ws", "http://h")
            .channels(vec!["chat".to_string()]);
        assert_eq!(config.transport, TransportMode::Auto);
        assert_eq!(config.channels, vec!["chat".to_string()]);
    }
}
