//! Message routing and the shared relay context.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::client::{ChatClient, ClientEvent, InboundMessage};
use crate::config::{ChatRef, Config};
use crate::filter::{FilterState, SkipReason, Verdict, norm};
use crate::qr;
use crate::status::Status;

/// Single-slot cache for the resolved target chat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSlot {
    resolved: Option<ChatRef>,
}

impl TargetSlot {
    /// A slot pre-filled when the config names the target by id.
    pub fn seeded(filter: &FilterState) -> Self {
        let resolved = filter.target_id.as_ref().map(|id| ChatRef {
            id: id.clone(),
            name: filter.target_name.clone().unwrap_or_default(),
        });
        Self { resolved }
    }

    pub fn get(&self) -> Option<&ChatRef> {
        self.resolved.as_ref()
    }

    pub fn fill(&mut self, target: ChatRef) {
        self.resolved = Some(target);
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent { target_id: String },
    Skipped(SkipReason),
    /// Eligible, but no target chat could be found.
    NoTarget,
    /// Target lookup or delivery failed. Recorded as the last error.
    Failed,
}

struct Current {
    config: Arc<Config>,
    filter: Arc<FilterState>,
    target: TargetSlot,
    /// Bumped on every replace so a lookup started under an older config
    /// never fills the slot of a newer one.
    generation: u64,
}

/// The relay context: current config, its derived filter state, the target
/// cache and the runtime status. Shared by the event loop and the dashboard.
pub struct Bridge {
    current: RwLock<Current>,
    status: Mutex<Status>,
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        let filter = FilterState::from_config(&config);
        Self {
            current: RwLock::new(Current {
                target: TargetSlot::seeded(&filter),
                config: Arc::new(config),
                filter: Arc::new(filter),
                generation: 0,
            }),
            status: Mutex::new(Status::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Current> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Current> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_mut(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.read().config)
    }

    pub fn filter(&self) -> Arc<FilterState> {
        Arc::clone(&self.read().filter)
    }

    /// Config and the filter state derived from it, taken together.
    pub fn snapshot(&self) -> (Arc<Config>, Arc<FilterState>) {
        let current = self.read();
        (Arc::clone(&current.config), Arc::clone(&current.filter))
    }

    pub fn cached_target(&self) -> Option<ChatRef> {
        self.read().target.get().cloned()
    }

    /// Swap in a new config and rebuild everything derived from it in one
    /// step. Returns the previous config.
    pub fn replace(&self, config: Config) -> Arc<Config> {
        let filter = FilterState::from_config(&config);
        let mut current = self.write();
        let previous = std::mem::replace(&mut current.config, Arc::new(config));
        current.target = TargetSlot::seeded(&filter);
        current.filter = Arc::new(filter);
        current.generation += 1;
        previous
    }

    pub fn status(&self) -> Status {
        self.status_mut().clone()
    }

    pub fn record_error(&self, error: impl Into<String>) {
        self.status_mut().record_error(error);
    }

    /// Like [`Bridge::record_error`] but gives up if the status is locked.
    /// For use from a panic hook, which may run while the lock is held.
    pub fn try_record_error(&self, error: impl Into<String>) {
        if let Ok(mut status) = self.status.try_lock() {
            status.record_error(error);
        }
    }

    /// Find the target chat id, enumerating chats only when the cache is
    /// empty and a target name is configured.
    pub async fn resolve_target(&self, client: &dyn ChatClient) -> Result<Option<ChatRef>> {
        let (name, generation) = {
            let current = self.read();
            if let Some(target) = current.target.get() {
                return Ok(Some(target.clone()));
            }
            (current.filter.target_name.clone(), current.generation)
        };
        let Some(name) = name else {
            return Ok(None);
        };

        let wanted = norm(&name);
        let chats = client.get_chats().await?;
        let Some(chat) = chats
            .into_iter()
            .find(|c| c.is_group && !c.id.is_empty() && norm(&c.name) == wanted)
        else {
            return Ok(None);
        };

        let target = ChatRef {
            id: chat.id,
            name: if chat.name.is_empty() { name } else { chat.name },
        };
        let mut current = self.write();
        if current.generation == generation {
            current.target.fill(target.clone());
        }
        Ok(Some(target))
    }

    /// Decide whether `msg` is relayed and, if so, send the prefixed copy.
    /// Errors are recorded, never propagated or retried.
    pub async fn handle_message(&self, client: &dyn ChatClient, msg: &InboundMessage) -> Outcome {
        let (config, filter) = self.snapshot();
        let debug = config.whatsapp.debug;

        if let Verdict::Skip(reason) = filter.evaluate(msg, config.whatsapp.allow_own) {
            if debug {
                let preview: String = msg.body.chars().take(120).collect();
                info!(chat = %msg.chat.name, ?reason, "Skipped message: \"{preview}\"");
            }
            return Outcome::Skipped(reason);
        }

        let target = match self.resolve_target(client).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                if debug {
                    info!("Target not resolved yet");
                }
                return Outcome::NoTarget;
            }
            Err(e) => {
                let e = format!("target lookup failed: {e:#}");
                error!("{e}");
                self.record_error(e);
                return Outcome::Failed;
            }
        };

        let text = format!("[{}] {}", msg.chat.name, msg.body);
        match client.send_message(&target.id, &text).await {
            Ok(()) => {
                info!("✅ Sent to \"{}\" from \"{}\"", target.label(), msg.chat.name);
                Outcome::Sent { target_id: target.id }
            }
            Err(e) => {
                let e = format!("{e:#}");
                error!("Error handling message: {e}");
                self.record_error(e);
                Outcome::Failed
            }
        }
    }

    /// Apply one client event.
    pub async fn handle_event(&self, client: &dyn ChatClient, event: ClientEvent) {
        match event {
            ClientEvent::Qr(code) => {
                info!("QR received. Scan it with WhatsApp on your phone.");
                match qr::to_terminal(&code) {
                    Ok(text) => println!("{text}"),
                    Err(e) => warn!("Failed to render QR for terminal: {e}"),
                }
                self.status_mut().set_qr(&code);
            }
            ClientEvent::Ready => {
                self.status_mut().set_ready();
                info!("✅ WhatsApp client ready");
            }
            ClientEvent::AuthFailure(message) => {
                let mut status = self.status_mut();
                status.set_auth_failure(&message);
                error!("{}", status.last_error.as_deref().unwrap_or_default());
            }
            ClientEvent::Disconnected(reason) => {
                let mut status = self.status_mut();
                status.set_disconnected(&reason);
                error!("{}", status.last_error.as_deref().unwrap_or_default());
            }
            ClientEvent::Message(msg) => {
                self.handle_message(client, &msg).await;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Consume client events one at a time until the stream ends. A panic while
/// handling one event is recorded and the loop moves on to the next.
pub async fn run_events(
    bridge: Arc<Bridge>,
    client: Arc<dyn ChatClient>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        let handled = AssertUnwindSafe(bridge.handle_event(client.as_ref(), event))
            .catch_unwind()
            .await;
        if let Err(payload) = handled {
            let e = format!("panic while handling client event: {}", panic_message(payload.as_ref()));
            error!("{e}");
            bridge.record_error(e);
        }
    }
    warn!("Client event stream ended");
}
