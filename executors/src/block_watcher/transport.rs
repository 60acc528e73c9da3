use std::{fmt, time::Duration};

use alloy::transports::http::reqwest::Url;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use submitter_core::{
    BlockHeader,
    chain::RpcEndpoints,
    constants::{DEFAULT_CONNECT_RETRY_DELAY, DEFAULT_MAX_ATTEMPTS_PER_URL, DEFAULT_POLLING_INTERVAL},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

use super::connector::{BlockPoller, BlockStream, EndpointConnector};
use crate::metrics;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportError {
    #[error("Failed to connect to {url}: {message}")]
    Connection { url: String, message: String },

    #[error("Block subscription on {url} failed: {message}")]
    Subscription { url: String, message: String },

    #[error("Block polling on {url} failed: {message}")]
    Polling { url: String, message: String },

    #[error("Could not start a block stream on any of {ws_urls} websocket and {http_urls} HTTP endpoints")]
    #[serde(rename_all = "camelCase")]
    Exhausted { ws_urls: usize, http_urls: usize },

    #[error("No RPC endpoints configured")]
    NoEndpoints,
}

/// Events emitted by an active block stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Block(BlockHeader),
    /// The stream died and has been cleaned up. It is not restarted.
    Error(TransportError),
    /// The stream was stopped through [`ChainTransport::stop_block_stream`].
    Stopped { url: Option<Url> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "ws",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_attempts_per_url: u32,
    pub connect_retry_delay: Duration,
    pub polling_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_url: DEFAULT_MAX_ATTEMPTS_PER_URL,
            connect_retry_delay: DEFAULT_CONNECT_RETRY_DELAY,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }
}

struct ActiveStream {
    url: Url,
    kind: TransportKind,
    task: JoinHandle<()>,
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Produces a single block stream out of prioritised websocket and HTTP
/// endpoint lists.
///
/// Websocket endpoints are tried first, in round-robin order starting from
/// the last one that worked. If none of them can be subscribed to, HTTP
/// endpoints are validated and polled instead. Once started, the stream does
/// not recover on its own: a failure is reported as [`StreamEvent::Error`]
/// and the owner decides when to start again.
pub struct ChainTransport<C: EndpointConnector> {
    connector: C,
    endpoints: RpcEndpoints,
    config: TransportConfig,
    ws_index: usize,
    http_index: usize,
    active: Option<ActiveStream>,
    /// Sink of the last start, told about the stop even when nothing came up.
    events: Option<mpsc::UnboundedSender<StreamEvent>>,
    stopped: bool,
}

impl<C: EndpointConnector> ChainTransport<C> {
    pub fn new(connector: C, endpoints: RpcEndpoints, config: TransportConfig) -> Self {
        let endpoints = RpcEndpoints {
            ws: endpoints
                .ws
                .into_iter()
                .filter(|url| matches!(url.scheme(), "ws" | "wss"))
                .collect(),
            http: endpoints
                .http
                .into_iter()
                .filter(|url| matches!(url.scheme(), "http" | "https"))
                .collect(),
        };

        tracing::info!(
            ws_urls = endpoints.ws.len(),
            http_urls = endpoints.http.len(),
            "Chain transport initialised"
        );

        Self {
            connector,
            endpoints,
            config,
            ws_index: 0,
            http_index: 0,
            active: None,
            events: None,
            stopped: true,
        }
    }

    pub fn endpoints(&self) -> &RpcEndpoints {
        &self.endpoints
    }

    /// URL and kind of the stream currently running, if any.
    pub fn active(&self) -> Option<(&Url, TransportKind)> {
        self.active
            .as_ref()
            .filter(|active| !active.task.is_finished())
            .map(|active| (&active.url, active.kind))
    }

    /// Starts a block stream that reports into `events`.
    #[tracing::instrument(name = "start_block_stream", skip_all)]
    pub async fn start_block_stream(
        &mut self,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<(Url, TransportKind), TransportError> {
        if self.endpoints.is_empty() {
            return Err(TransportError::NoEndpoints);
        }

        // Starting again replaces whatever was running before
        self.active = None;
        self.events = Some(events.clone());
        self.stopped = false;

        if !self.endpoints.ws.is_empty() {
            if let Some(url) = self.try_start_websocket(&events).await {
                metrics::record_transport_started(TransportKind::WebSocket.as_str());
                return Ok((url, TransportKind::WebSocket));
            }
            tracing::warn!("Failed to start a websocket block stream, falling back to HTTP polling");
        }

        if !self.endpoints.http.is_empty() {
            if let Some(url) = self.try_start_http_polling(&events).await {
                metrics::record_transport_started(TransportKind::Http.as_str());
                return Ok((url, TransportKind::Http));
            }
            tracing::warn!("Failed to start HTTP block polling");
        }

        Err(TransportError::Exhausted {
            ws_urls: self.endpoints.ws.len(),
            http_urls: self.endpoints.http.len(),
        })
    }

    /// Tears down the running stream and reports [`StreamEvent::Stopped`] to
    /// the sink of the last start. Calling it again is a no-op.
    pub fn stop_block_stream(&mut self) {
        if self.stopped {
            tracing::trace!("Block stream already stopped");
            return;
        }
        self.stopped = true;

        let url = match self.active.take() {
            Some(active) => {
                tracing::info!(url = %active.url, kind = %active.kind, "Stopping block stream");
                active.task.abort();
                Some(active.url.clone())
            }
            None => {
                tracing::info!("Stopping block stream, nothing was running");
                None
            }
        };

        if let Some(events) = self.events.take() {
            let _ = events.send(StreamEvent::Stopped { url });
        }
    }

    async fn try_start_websocket(
        &mut self,
        events: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Option<Url> {
        let urls = self.endpoints.ws.clone();
        let initial = self.ws_index % urls.len();
        self.ws_index = initial;

        loop {
            let url = &urls[self.ws_index];

            for attempt in 1..=self.config.max_attempts_per_url {
                tracing::info!(
                    url = %url,
                    attempt,
                    max_attempts = self.config.max_attempts_per_url,
                    index = self.ws_index,
                    "Subscribing to newHeads over websocket"
                );

                match self.connector.subscribe_blocks(url).await {
                    Ok(stream) => {
                        let task = tokio::spawn(forward_subscription(
                            url.clone(),
                            stream,
                            events.clone(),
                        ));
                        self.active = Some(ActiveStream {
                            url: url.clone(),
                            kind: TransportKind::WebSocket,
                            task,
                        });
                        tracing::info!(url = %url, "Subscribed to newHeads over websocket");
                        return Some(url.clone());
                    }
                    Err(e) => {
                        tracing::error!(url = %url, attempt, error = %e, "Websocket subscription failed");
                    }
                }

                if attempt < self.config.max_attempts_per_url {
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
            }

            self.ws_index = (self.ws_index + 1) % urls.len();
            if self.ws_index == initial {
                return None;
            }
        }
    }

    async fn try_start_http_polling(
        &mut self,
        events: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Option<Url> {
        let urls = self.endpoints.http.clone();
        let initial = self.http_index % urls.len();
        self.http_index = initial;

        loop {
            let url = &urls[self.http_index];

            for attempt in 1..=self.config.max_attempts_per_url {
                tracing::info!(
                    url = %url,
                    attempt,
                    max_attempts = self.config.max_attempts_per_url,
                    index = self.http_index,
                    "Connecting to HTTP endpoint for block polling"
                );

                match self.validate_http(url).await {
                    Ok((poller, baseline)) => {
                        let task = tokio::spawn(poll_blocks(
                            url.clone(),
                            poller,
                            baseline,
                            self.config.polling_interval,
                            events.clone(),
                        ));
                        self.active = Some(ActiveStream {
                            url: url.clone(),
                            kind: TransportKind::Http,
                            task,
                        });
                        tracing::info!(url = %url, "Started HTTP block polling");
                        return Some(url.clone());
                    }
                    Err(e) => {
                        tracing::error!(url = %url, attempt, error = %e, "HTTP endpoint validation failed");
                    }
                }

                if attempt < self.config.max_attempts_per_url {
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
            }

            self.http_index = (self.http_index + 1) % urls.len();
            if self.http_index == initial {
                return None;
            }
        }
    }

    /// Checks the endpoint answers, then reads the block polling starts from.
    async fn validate_http(&self, url: &Url) -> Result<(C::Poller, Option<u64>), TransportError> {
        let poller = self.connector.connect_http(url)?;
        poller.block_number().await?;

        let baseline = match poller.latest_block().await {
            Ok(Some(block)) => {
                tracing::info!(url = %url, block_number = block.number, "HTTP polling baseline block");
                Some(block.number)
            }
            Ok(None) => {
                tracing::warn!(url = %url, "No baseline block for HTTP polling");
                None
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Failed to fetch baseline block for HTTP polling");
                None
            }
        };

        Ok((poller, baseline))
    }
}

async fn forward_subscription(
    url: Url,
    mut stream: BlockStream,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(block) => {
                if events.send(StreamEvent::Block(block)).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(url = %url, error = %e, "Websocket block subscription error");
                let _ = events.send(StreamEvent::Error(e));
                return;
            }
        }
    }

    tracing::error!(url = %url, "Websocket block subscription closed");
    let _ = events.send(StreamEvent::Error(TransportError::Subscription {
        url: url.to_string(),
        message: "subscription closed".to_string(),
    }));
}

async fn poll_blocks<P: BlockPoller>(
    url: Url,
    poller: P,
    mut last_number: Option<u64>,
    polling_interval: Duration,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let mut interval = tokio::time::interval(polling_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;

        let block = match poller.latest_block().await {
            Ok(Some(block)) => block,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(url = %url, error = %e, "HTTP block polling error");
                let _ = events.send(StreamEvent::Error(e));
                return;
            }
        };

        match last_number {
            Some(last) if block.number <= last => continue,
            Some(last) if block.number > last + 1 => {
                tracing::warn!(
                    url = %url,
                    from = last,
                    to = block.number,
                    "HTTP polling gap detected, processing latest block only"
                );
            }
            _ => {}
        }

        last_number = Some(block.number);
        if events.send(StreamEvent::Block(block)).is_err() {
            return;
        }
    }
}
