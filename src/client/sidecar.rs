//! WebSocket connection to the WhatsApp Web sidecar.
//!
//! The sidecar owns the browser session. This side keeps one connection
//! open, reconnecting after a fixed delay, forwards pushed events to an
//! unbounded channel and matches request replies by `requestId`. The reader
//! never waits on the event consumer, since the consumer may itself be
//! waiting for a reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{GatewayMessage, Incoming, Reply, SidecarMessage};
use super::{ChatClient, ChatInfo, ClientEvent};
use crate::config::Config;

/// Default sidecar WebSocket address.
pub const DEFAULT_SIDECAR_URL: &str = "ws://127.0.0.1:9876";

/// Session name the sidecar stores its auth state under.
pub const CLIENT_ID: &str = "wa-forwarder";

#[derive(Debug, Clone)]
pub struct SidecarOptions {
    pub url: String,
    pub client_id: String,
    pub headless: bool,
    pub executable_path: Option<String>,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
}

impl SidecarOptions {
    /// Launch options taken from the browser-related config fields.
    pub fn from_config(config: &Config, url: impl Into<String>) -> Self {
        let path = &config.whatsapp.puppeteer_executable_path;
        Self {
            url: url.into(),
            client_id: CLIENT_ID.to_string(),
            headless: config.whatsapp.headless,
            executable_path: (!path.is_empty()).then(|| path.clone()),
            reconnect_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
        }
    }

    fn init_message(&self) -> GatewayMessage {
        GatewayMessage::Init {
            client_id: self.client_id.clone(),
            headless: self.headless,
            executable_path: self.executable_path.clone(),
        }
    }
}

type Pending = Mutex<HashMap<String, oneshot::Sender<Reply>>>;

/// [`ChatClient`] backed by the sidecar.
pub struct SidecarClient {
    /// Writer for the current connection, if any.
    outgoing: RwLock<Option<mpsc::Sender<GatewayMessage>>>,
    pending: Pending,
    request_timeout: Duration,
}

impl SidecarClient {
    /// Start the connection loop. Events arrive on the returned receiver;
    /// the loop stops once the receiver is dropped.
    pub fn spawn(options: SidecarOptions) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            outgoing: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            request_timeout: options.request_timeout,
        });
        tokio::spawn(Arc::clone(&client).run(options, events_tx));
        (client, events_rx)
    }

    async fn run(self: Arc<Self>, options: SidecarOptions, events: mpsc::UnboundedSender<ClientEvent>) {
        info!(url = %options.url, "connecting to WhatsApp sidecar");
        while !events.is_closed() {
            match connect_async(&options.url).await {
                Ok((ws, _)) => {
                    info!("connected to WhatsApp sidecar");
                    if let Err(e) = self.session(ws, &options, &events).await {
                        error!(error = %e, "sidecar session ended");
                    }
                    *self.outgoing.write().await = None;
                    self.fail_pending();
                    let lost = ClientEvent::Disconnected("sidecar connection lost".to_string());
                    if events.send(lost).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "sidecar not reachable");
                }
            }
            tokio::time::sleep(options.reconnect_delay).await;
        }
        info!("sidecar event consumer gone, stopping");
    }

    async fn session(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        options: &SidecarOptions,
        events: &mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<()> {
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::channel::<GatewayMessage>(32);

        tx.send(options.init_message())
            .await
            .context("failed to queue init message")?;
        *self.outgoing.write().await = Some(tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            error!(error = %e, "failed to send message to sidecar");
                            break;
                        }
                        debug!(?msg, "sent message to sidecar");
                    }
                    Err(e) => error!(error = %e, "failed to serialize message"),
                }
            }
        });

        let result = loop {
            let Some(frame) = read.next().await else {
                break Ok(());
            };
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<SidecarMessage>(&text) {
                    Ok(msg) => {
                        if !self.dispatch(msg.into(), events) {
                            break Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, text = %text, "failed to parse sidecar message"),
                },
                Ok(Message::Close(_)) => {
                    info!("sidecar connection closed");
                    break Ok(());
                }
                Ok(_) => {}
                Err(e) => break Err(anyhow!(e).context("WebSocket read error")),
            }
        };

        writer.abort();
        result
    }

    /// Returns false when the event consumer is gone.
    fn dispatch(&self, incoming: Incoming, events: &mpsc::UnboundedSender<ClientEvent>) -> bool {
        match incoming {
            Incoming::Event(event) => events.send(event).is_ok(),
            Incoming::Reply { request_id, reply } => {
                let waiter = self.pending_lock().remove(&request_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!(request_id, "reply for unknown or expired request"),
                }
                true
            }
            Incoming::Error(error) => {
                warn!(error, "sidecar reported an error");
                true
            }
        }
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every waiter so in-flight requests fail instead of hanging.
    fn fail_pending(&self) {
        self.pending_lock().clear();
    }

    async fn request(&self, build: impl FnOnce(String) -> GatewayMessage) -> Result<Reply> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(request_id.clone(), tx);

        let sender = self.outgoing.read().await.clone();
        let Some(sender) = sender else {
            self.pending_lock().remove(&request_id);
            bail!("sidecar not connected");
        };
        if sender.send(build(request_id.clone())).await.is_err() {
            self.pending_lock().remove(&request_id);
            bail!("sidecar connection closed");
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => bail!("sidecar connection lost before reply"),
            Err(_) => {
                self.pending_lock().remove(&request_id);
                bail!("sidecar request {request_id} timed out")
            }
        }
    }
}

#[async_trait]
impl ChatClient for SidecarClient {
    async fn get_chats(&self) -> Result<Vec<ChatInfo>> {
        match self.request(|request_id| GatewayMessage::GetChats { request_id }).await? {
            Reply::Chats(chats) => chats.map_err(|e| anyhow!("get_chats failed: {e}")),
            Reply::Sent(_) => bail!("unexpected reply to get_chats"),
        }
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        let reply = self
            .request(|request_id| GatewayMessage::SendText {
                request_id,
                to: chat_id.to_string(),
                text: text.to_string(),
            })
            .await?;
        match reply {
            Reply::Sent(result) => result.map_err(|e| anyhow!("send to {chat_id} failed: {e}")),
            Reply::Chats(_) => bail!("unexpected reply to send_text"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        let options = SidecarOptions::from_config(&config, DEFAULT_SIDECAR_URL);
        assert_eq!(options.executable_path, None);
        assert!(!options.headless);

        config.whatsapp.headless = true;
        config.whatsapp.puppeteer_executable_path = "/usr/bin/chromium".into();
        let options = SidecarOptions::from_config(&config, "ws://sidecar:1");
        assert!(options.headless);
        assert_eq!(options.executable_path.as_deref(), Some("/usr/bin/chromium"));
        assert_eq!(options.url, "ws://sidecar:1");
    }

    #[tokio::test]
    async fn test_request_without_connection_fails() {
        let client = SidecarClient {
            outgoing: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            request_timeout: Duration::from_secs(1),
        };
        let err = client.get_chats().await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        assert!(client.pending_lock().is_empty());
    }

    #[tokio::test]
    async fn test_reply_is_routed_to_waiter() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = Arc::new(SidecarClient {
            outgoing: RwLock::new(Some(tx)),
            pending: Mutex::new(HashMap::new()),
            request_timeout: Duration::from_secs(5),
        });

        let sender = Arc::clone(&client);
        let call = tokio::spawn(async move { sender.send_message("g2", "hi").await });

        let Some(GatewayMessage::SendText { request_id, to, text }) = rx.recv().await else {
            panic!("expected send_text");
        };
        assert_eq!((to.as_str(), text.as_str()), ("g2", "hi"));

        let (events, _events_rx) = mpsc::unbounded_channel();
        let reply = Incoming::Reply { request_id, reply: Reply::Sent(Ok(())) };
        assert!(client.dispatch(reply, &events));
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reply_read_behind_event_burst() {
        use tokio_tungstenite::accept_async;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (burst_sent_tx, burst_sent_rx) = oneshot::channel();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let Some(Ok(Message::Text(init))) = ws.next().await else {
                panic!("expected init");
            };
            assert!(init.contains("\"type\":\"init\""));

            for i in 0..300 {
                let event = serde_json::json!({
                    "type": "message",
                    "chat": { "id": "g1", "name": "Alerts", "isGroup": true },
                    "body": format!("fire {i}"),
                });
                ws.send(Message::Text(event.to_string().into())).await.unwrap();
            }
            burst_sent_tx.send(()).unwrap();

            let Some(Ok(Message::Text(request))) = ws.next().await else {
                panic!("expected get_chats");
            };
            let request: serde_json::Value = serde_json::from_str(&request).unwrap();
            assert_eq!(request["type"], "get_chats");
            let reply = serde_json::json!({
                "type": "chats",
                "requestId": request["requestId"],
                "chats": [{ "id": "g2", "name": "Control", "isGroup": true }],
            });
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
            // Hold the socket open until the client is done.
            let _ = ws.next().await;
        });

        let options = SidecarOptions {
            url: format!("ws://127.0.0.1:{port}"),
            client_id: CLIENT_ID.to_string(),
            headless: true,
            executable_path: None,
            reconnect_delay: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
        };
        // Nobody drains the events while the request is in flight.
        let (client, mut events) = SidecarClient::spawn(options);
        burst_sent_rx.await.unwrap();

        let chats = client.get_chats().await.unwrap();
        assert_eq!(chats, vec![ChatInfo { id: "g2".into(), name: "Control".into(), is_group: true }]);

        let mut received = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, ClientEvent::Message(_)));
            received += 1;
        }
        assert_eq!(received, 300);
        server.abort();
    }
}
