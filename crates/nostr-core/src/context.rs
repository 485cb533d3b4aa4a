//! Process context: owns the store, caches, multiplexer and trim service,
//! and routes raw relay traffic into them.

use crate::config::CoreConfig;
use crate::decrypt::{DecryptionCache, Decryptor};
use crate::event::Event;
use crate::message::RelayMessage;
use crate::relay::{RelayNormalizer, RelayUrl};
use crate::store::{InsertOutcome, LocalStore};
use crate::subscription::{Multiplexer, RelayTransport};
use crate::trim::{RetentionContext, TrimOutcome, TrimService};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to one relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Event(InsertOutcome),
    Eose { matched: bool },
    Ok { accepted: bool },
    Closed,
    Notice,
    Auth,
    Unknown,
    /// Bad relay URL or unparseable message
    Malformed,
}

pub struct ViewContext {
    config: CoreConfig,
    store: Arc<LocalStore>,
    decryption: Arc<DecryptionCache>,
    subscriptions: Multiplexer,
    trim: Arc<TrimService>,
    relays: RelayNormalizer,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ViewContext {
    pub fn new(config: CoreConfig, transport: Arc<dyn RelayTransport>) -> Self {
        let decryption = Arc::new(DecryptionCache::new(config.decrypt_cache_capacity));
        let store = Arc::new(
            LocalStore::new(config.retain_superseded_versions)
                .with_tombstone_capacity(config.tombstone_capacity)
                .with_decryption_cache(decryption.clone()),
        );
        let trim = Arc::new(
            TrimService::new(store.clone(), config.dm_retention_secs)
                .with_tombstone_retention(config.tombstone_retention_secs),
        );
        let subscriptions = Multiplexer::new(transport, config.eose_clock_skew_secs);
        let relays = RelayNormalizer::new(config.relay_cache_capacity);
        Self {
            config,
            store,
            decryption,
            subscriptions,
            trim,
            relays,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_decryptor(self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryption.set_decryptor(Some(decryptor));
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn decryption(&self) -> &Arc<DecryptionCache> {
        &self.decryption
    }

    pub fn subscriptions(&self) -> &Multiplexer {
        &self.subscriptions
    }

    pub fn trim_service(&self) -> &Arc<TrimService> {
        &self.trim
    }

    pub fn normalize_relay(&self, raw: &str) -> Option<RelayUrl> {
        self.relays.normalize(raw)
    }

    /// Entry point for the transport: one text frame from one relay.
    pub async fn handle_relay_message(&self, relay: &str, text: &str) -> Handled {
        let Some(relay) = self.relays.normalize(relay) else {
            warn!("Dropping message from unparseable relay url {relay:?}");
            return Handled::Malformed;
        };
        match RelayMessage::from_json(text) {
            Ok(message) => self.ingest(&relay, message).await,
            Err(e) => {
                debug!("Malformed message from {relay}: {e}");
                Handled::Malformed
            }
        }
    }

    pub async fn ingest(&self, relay: &RelayUrl, message: RelayMessage) -> Handled {
        match message {
            RelayMessage::Event { sub_id, event } => {
                if self.subscriptions.route(&sub_id).is_none() {
                    debug!("Event {} from {relay} on unknown subscription {sub_id}", event.id);
                }
                Handled::Event(self.accept_from_relay(*event, relay))
            }
            RelayMessage::EndOfStoredEvents { sub_id } => Handled::Eose {
                matched: self.subscriptions.on_eose(relay, &sub_id).await,
            },
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if accepted {
                    self.store.mark_seen(&event_id, relay);
                } else {
                    warn!("Relay {relay} refused {event_id}: {message}");
                }
                Handled::Ok { accepted }
            }
            RelayMessage::Closed { sub_id, message } => {
                self.subscriptions.on_closed(relay, &sub_id, &message).await;
                Handled::Closed
            }
            RelayMessage::Notice { message } => {
                info!("Notice from {relay}: {message}");
                Handled::Notice
            }
            RelayMessage::Auth { .. } => {
                debug!("Auth challenge from {relay}");
                Handled::Auth
            }
            RelayMessage::Unknown(label) => {
                debug!("Ignoring {label} from {relay}");
                Handled::Unknown
            }
        }
    }

    fn accept_from_relay(&self, event: Event, relay: &RelayUrl) -> InsertOutcome {
        if self.config.require_relay_signatures && event.sig.is_empty() {
            debug!("Unsigned event {} from {relay} rejected", event.id);
            self.store.metrics().record(false);
            return InsertOutcome::Rejected;
        }
        self.store.insert(event, Some(relay))
    }

    /// Plaintext of a private event, decrypted at most once.
    pub async fn decrypted_view(&self, event: &Event) -> Option<Arc<str>> {
        self.decryption.decrypted_view(event).await
    }

    pub async fn trim(&self, retention: &RetentionContext) -> TrimOutcome {
        self.trim.trim(retention).await
    }

    /// Trim on the configured interval until [`ViewContext::shutdown`].
    pub fn start_trim_loop<F>(&self, retention: F)
    where
        F: Fn() -> RetentionContext + Send + Sync + 'static,
    {
        let handle = self.trim.clone().spawn_periodic(
            Duration::from_secs(self.config.trim_interval_secs),
            retention,
            self.shutdown.child_token(),
        );
        self.tasks.lock().push(handle);
    }

    /// Cancel background work and close every subscription.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.subscriptions.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("View context shut down");
    }
}
