use crate::codec::{self, ListenAck, Topic};
use crate::config::ManagerConfig;
use crate::error::{AddTopicError, Error};
use crate::metrics::Metrics;
use crate::nonce;
use crate::retry::RetryPolicy;
use crate::shard::ShardState;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, timeout, Instant as TokioInstant};
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Commands that can be sent to a shard's connection task
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Subscribe one more topic via the add-topic correlation protocol
    AddTopic {
        topic: Topic,
        reply: oneshot::Sender<Result<usize, AddTopicError>>,
    },
    /// Gracefully close the connection and stop the task
    Close,
}

/// Notifications a shard sends up to its manager
#[derive(Debug)]
pub(crate) enum ShardNotice {
    /// The shard connected and sent its subscribe request
    Ready { shard_id: usize, topic_count: usize },
    /// A raw inbound text frame, in transport receive order
    Message { shard_id: usize, raw: String },
    /// The retry budget is exhausted; the shard will not reconnect
    Disconnected { shard_id: usize, reason: String },
}

/// An armed add-topic correlation ticket, keyed by its request nonce.
///
/// At most one ticket is armed at a time; further add requests queue behind
/// it. The window always runs to its deadline before the outcome is reported.
struct ActiveAdd {
    topic: Topic,
    nonce: String,
    deadline: TokioInstant,
    ack: Option<ListenAck>,
    reply: oneshot::Sender<Result<usize, AddTopicError>>,
}

enum AckOutcome {
    NoResponse,
    Rejected(String),
    Accepted,
}

fn evaluate_ack(ack: Option<ListenAck>) -> AckOutcome {
    match ack {
        None => AckOutcome::NoResponse,
        Some(ack) if !ack.error.is_empty() => AckOutcome::Rejected(ack.error),
        Some(_) => AckOutcome::Accepted,
    }
}

type WsSink = SplitSink<WsStream, Message>;

/// Owns one WebSocket connection and its topic set.
///
/// The task is the only writer of its topic list and pending tickets; the
/// manager talks to it exclusively through [`ConnectionCommand`].
pub(crate) struct Connection {
    shard_id: usize,
    topics: Vec<Topic>,
    config: ManagerConfig,
    metrics: Arc<Metrics>,
    notice_tx: mpsc::Sender<ShardNotice>,
    command_rx: mpsc::Receiver<ConnectionCommand>,
    retry: RetryPolicy,
    state: ShardState,
    active: Option<ActiveAdd>,
    queued: VecDeque<(Topic, oneshot::Sender<Result<usize, AddTopicError>>)>,
}

impl Connection {
    pub fn new(
        shard_id: usize,
        topics: Vec<Topic>,
        config: ManagerConfig,
        metrics: Arc<Metrics>,
        notice_tx: mpsc::Sender<ShardNotice>,
        command_rx: mpsc::Receiver<ConnectionCommand>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.rapid_window, config.retry.max_rapid_retries);
        Self {
            shard_id,
            topics,
            config,
            metrics,
            notice_tx,
            command_rx,
            retry,
            state: ShardState::Connecting,
            active: None,
            queued: VecDeque::new(),
        }
    }

    /// Run the connection loop (reconnects on failure)
    pub async fn run(mut self) {
        loop {
            match self.connect_and_run().await {
                Ok(true) => {
                    debug!("[SHARD-{}] Connection closed gracefully", self.shard_id);
                    self.mark_disconnected();
                    return;
                }
                Ok(false) => {
                    info!("[SHARD-{}] Connection closed by peer", self.shard_id);
                }
                Err(e) => {
                    warn!("[SHARD-{}] Connection error: {}", self.shard_id, e);
                }
            }

            self.set_state(ShardState::Closed);
            self.mark_disconnected();
            self.fail_pending();

            let tries = self.retry.record_close(Instant::now());
            debug!(
                "[SHARD-{}] Connection lost (rapid closes: {})",
                self.shard_id, tries
            );

            tokio::time::sleep(self.config.retry.delay).await;

            if self.retry.is_exhausted() {
                self.set_state(ShardState::Failed);
                self.metrics.record_shard_failed();
                warn!(
                    "[SHARD-{}] Retry budget exhausted, shard is out of service",
                    self.shard_id
                );
                self.notify(ShardNotice::Disconnected {
                    shard_id: self.shard_id,
                    reason: "shard failed to reconnect".to_string(),
                })
                .await;
                return;
            }

            self.set_state(ShardState::Reconnecting);
            self.metrics.record_reconnection();
        }
    }

    /// Connect, subscribe, and pump until disconnection.
    /// Returns Ok(true) if the task should stop, Ok(false) to reconnect.
    async fn connect_and_run(&mut self) -> Result<bool, Error> {
        debug!(
            "[SHARD-{}] Connecting to {}",
            self.shard_id, self.config.endpoint
        );

        let ws = match timeout(
            self.config.connect_timeout,
            connect_endpoint(&self.config.endpoint),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Connect("connection timeout".to_string())),
        };

        self.metrics.record_connection();
        let topic_count = self.topics.len();
        self.metrics.update_shard(self.shard_id, |s| {
            s.is_connected = true;
            s.topic_count = topic_count;
        });

        let (mut write, mut read) = ws.split();

        // Subscribe the full topic set with a fresh per-connect nonce.
        let connect_nonce = nonce::generate();
        let frame = codec::listen_request(
            &connect_nonce,
            &self.topics,
            &self.config.credentials.token,
        )?;
        write.send(Message::Text(frame)).await?;
        self.metrics.record_listen_request();
        self.metrics.record_message_sent();

        self.set_state(ShardState::Connected);
        info!(
            "[SHARD-{}] Connected ({} topics)",
            self.shard_id, topic_count
        );
        self.notify(ShardNotice::Ready {
            shard_id: self.shard_id,
            topic_count,
        })
        .await;

        let mut heartbeat = interval_at(
            TokioInstant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        loop {
            let add_deadline = self.active.as_ref().map(|a| a.deadline);

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(text).await,
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("[SHARD-{}] Received close frame", self.shard_id);
                            return Ok(false);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(Error::WebSocket(e)),
                        None => {
                            info!("[SHARD-{}] WebSocket stream ended", self.shard_id);
                            return Ok(false);
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::AddTopic { topic, reply }) => {
                            self.handle_add(topic, reply, &mut write).await?;
                        }
                        Some(ConnectionCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(true);
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    let frame = codec::ping_request()?;
                    write.send(Message::Text(frame)).await?;
                    self.metrics.record_ping();
                    self.metrics.record_message_sent();
                    trace!("[SHARD-{}] Heartbeat ping sent", self.shard_id);
                }

                _ = sleep_until(add_deadline.unwrap_or_else(TokioInstant::now)),
                    if add_deadline.is_some() =>
                {
                    self.finish_active();
                    self.arm_queued(&mut write).await?;
                }
            }
        }
    }

    /// Capture `LISTEN` acknowledgments for the armed ticket, then forward
    /// the raw frame upward in receive order.
    async fn handle_text(&mut self, text: String) {
        self.metrics.record_message_received();
        self.metrics.record_shard_message_received(self.shard_id);

        if let Some(active) = self.active.as_mut() {
            if active.ack.is_none() {
                if let Some(ack) = codec::parse_response(&text) {
                    // The upstream does not always echo the nonce back.
                    if ack.nonce.is_none() || ack.nonce.as_deref() == Some(active.nonce.as_str()) {
                        trace!(
                            "[SHARD-{}] Captured response for pending add",
                            self.shard_id
                        );
                        active.ack = Some(ack);
                    }
                }
            }
        }

        self.notify(ShardNotice::Message {
            shard_id: self.shard_id,
            raw: text,
        })
        .await;
    }

    async fn handle_add(
        &mut self,
        topic: Topic,
        reply: oneshot::Sender<Result<usize, AddTopicError>>,
        write: &mut WsSink,
    ) -> Result<(), Error> {
        if self.topics.len() >= self.config.topic_limit {
            debug!("[SHARD-{}] Add rejected, shard full", self.shard_id);
            let _ = reply.send(Err(AddTopicError::ShardFull {
                topic,
                shard_id: self.shard_id,
            }));
            return Ok(());
        }

        if self.topics.contains(&topic) {
            trace!("[SHARD-{}] Topic already subscribed", self.shard_id);
            let _ = reply.send(Ok(self.topics.len()));
            return Ok(());
        }

        if self.active.is_some() {
            self.queued.push_back((topic, reply));
            return Ok(());
        }

        self.arm(topic, reply, write).await
    }

    /// Send the candidate topic set and arm the correlation window.
    async fn arm(
        &mut self,
        topic: Topic,
        reply: oneshot::Sender<Result<usize, AddTopicError>>,
        write: &mut WsSink,
    ) -> Result<(), Error> {
        let request_nonce = nonce::generate();
        let mut candidate = self.topics.clone();
        candidate.push(topic.clone());

        let frame = codec::listen_request(
            &request_nonce,
            &candidate,
            &self.config.credentials.token,
        )?;
        if let Err(e) = write.send(Message::Text(frame)).await {
            let _ = reply.send(Err(AddTopicError::ShardUnavailable {
                topic,
                shard_id: self.shard_id,
            }));
            return Err(Error::WebSocket(e));
        }
        self.metrics.record_listen_request();
        self.metrics.record_message_sent();

        debug!("[SHARD-{}] Add armed for {}", self.shard_id, topic);
        self.active = Some(ActiveAdd {
            topic,
            nonce: request_nonce,
            deadline: TokioInstant::now() + self.config.response_timeout,
            ack: None,
            reply,
        });
        Ok(())
    }

    /// Resolve the armed ticket at window expiry.
    fn finish_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveAdd {
            topic, ack, reply, ..
        } = active;

        let result = match evaluate_ack(ack) {
            AckOutcome::NoResponse => {
                debug!("[SHARD-{}] Add timed out for {}", self.shard_id, topic);
                Err(AddTopicError::NoResponse {
                    topic,
                    shard_id: self.shard_id,
                })
            }
            AckOutcome::Rejected(message) => {
                debug!(
                    "[SHARD-{}] Add rejected for {}: {}",
                    self.shard_id, topic, message
                );
                Err(AddTopicError::Rejected {
                    topic,
                    shard_id: self.shard_id,
                    message,
                })
            }
            AckOutcome::Accepted => {
                self.topics.push(topic);
                let count = self.topics.len();
                self.metrics
                    .update_shard(self.shard_id, |s| s.topic_count = count);
                debug!(
                    "[SHARD-{}] Topic committed (count: {})",
                    self.shard_id, count
                );
                Ok(count)
            }
        };

        let _ = reply.send(result);
    }

    /// Arm the next queued add request, resolving fast paths along the way.
    async fn arm_queued(&mut self, write: &mut WsSink) -> Result<(), Error> {
        while self.active.is_none() {
            let Some((topic, reply)) = self.queued.pop_front() else {
                break;
            };
            self.handle_add(topic, reply, write).await?;
        }
        Ok(())
    }

    /// The correlation window cannot complete across a transport loss.
    fn fail_pending(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.reply.send(Err(AddTopicError::NoResponse {
                topic: active.topic,
                shard_id: self.shard_id,
            }));
        }
        for (topic, reply) in self.queued.drain(..) {
            let _ = reply.send(Err(AddTopicError::ShardUnavailable {
                topic,
                shard_id: self.shard_id,
            }));
        }
    }

    async fn notify(&self, notice: ShardNotice) {
        if self.notice_tx.send(notice).await.is_err() {
            debug!("[SHARD-{}] Manager is gone, notice dropped", self.shard_id);
        }
    }

    fn set_state(&mut self, next: ShardState) {
        trace!(
            "[SHARD-{}] State {:?} -> {:?}",
            self.shard_id,
            self.state,
            next
        );
        self.state = next;
    }

    fn mark_disconnected(&self) {
        self.metrics
            .update_shard(self.shard_id, |s| s.is_connected = false);
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to the configured endpoint (TCP, TLS if `wss`, then handshake).
async fn connect_endpoint(endpoint: &str) -> Result<WsStream, Error> {
    let url = Url::parse(endpoint).map_err(|e| Error::Connect(format!("invalid URL: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| Error::Connect("no host in URL".to_string()))?;
    let is_tls = url.scheme() == "wss";
    let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = endpoint.into_client_request().map_err(Error::WebSocket)?;

    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Connect(format!("TCP connect to {host}:{port} failed: {e}")))?;
    set_tcp_options(&stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::Connect(format!("TLS error: {e}")))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

/// Set TCP options for timely delivery
fn set_tcp_options(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);

    let _ = sock.set_nodelay(true);

    // Keepalive to detect dead connections between heartbeats
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(30))
        .with_interval(std::time::Duration::from_secs(10));
    let _ = sock.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_ack_no_response() {
        assert!(matches!(evaluate_ack(None), AckOutcome::NoResponse));
    }

    #[test]
    fn test_evaluate_ack_rejected() {
        let ack = ListenAck {
            nonce: Some("n".to_string()),
            error: "ERR_BADAUTH".to_string(),
        };
        match evaluate_ack(Some(ack)) {
            AckOutcome::Rejected(msg) => assert_eq!(msg, "ERR_BADAUTH"),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_evaluate_ack_accepted() {
        let ack = ListenAck {
            nonce: None,
            error: String::new(),
        };
        assert!(matches!(evaluate_ack(Some(ack)), AckOutcome::Accepted));
    }
}
