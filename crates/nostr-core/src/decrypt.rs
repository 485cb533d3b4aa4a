//! Decrypted views of private events.
//!
//! Decrypting is slow and, for remote signers, may involve a round trip, so
//! each `(signer, event id)` pair is decrypted at most once while it stays
//! in the cache. Concurrent requests for the same pair share one in-flight
//! decrypt through a `tokio::sync::OnceCell`. Failures are not cached.

use crate::error::DecryptError;
use crate::event::{Event, KnownKind};
use async_trait::async_trait;
use lru::LruCache;
use nostr_sdk::prelude::{nip04, nip44, Keys, PublicKey};
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Default number of decrypted plaintexts kept in memory.
pub const DEFAULT_DECRYPT_CACHE_CAPACITY: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    Nip04,
    Nip44,
}

impl EncryptionScheme {
    /// NIP-04 payloads carry a `?iv=` suffix; everything else is NIP-44.
    pub fn detect(content: &str) -> Self {
        if content.contains("?iv=") {
            Self::Nip04
        } else {
            Self::Nip44
        }
    }
}

/// The signer that can open ciphertexts addressed to it.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Hex public key of the signer. Part of the cache key.
    fn signer_pubkey(&self) -> String;

    async fn decrypt(
        &self,
        ciphertext: &str,
        counterparty: &str,
        scheme: EncryptionScheme,
    ) -> Result<String, DecryptError>;
}

/// Local-key decryptor over nostr-sdk's NIP-04/NIP-44 implementations.
pub struct KeysDecryptor {
    keys: Keys,
}

impl KeysDecryptor {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Decryptor for KeysDecryptor {
    fn signer_pubkey(&self) -> String {
        self.keys.public_key().to_hex()
    }

    async fn decrypt(
        &self,
        ciphertext: &str,
        counterparty: &str,
        scheme: EncryptionScheme,
    ) -> Result<String, DecryptError> {
        let public_key = PublicKey::from_hex(counterparty)
            .map_err(|e| DecryptError::BadCounterparty(e.to_string()))?;
        match scheme {
            EncryptionScheme::Nip04 => nip04::decrypt(self.keys.secret_key(), &public_key, ciphertext)
                .map_err(|e| DecryptError::Failed(e.to_string())),
            EncryptionScheme::Nip44 => nip44::decrypt(self.keys.secret_key(), &public_key, ciphertext)
                .map_err(|e| DecryptError::Failed(e.to_string())),
        }
    }
}

/// Whose key the ciphertext was encrypted against, from the signer's side.
pub fn counterparty(event: &Event, signer: &str) -> Option<String> {
    match event.known_kind() {
        KnownKind::Seal | KnownKind::GiftWrap => Some(event.pubkey.clone()),
        KnownKind::Draft => Some(signer.to_string()),
        _ if event.pubkey == signer => event.first_tag_value("p").map(String::from),
        _ => Some(event.pubkey.clone()),
    }
}

type Slot = Arc<OnceCell<Arc<str>>>;

pub struct DecryptionCache {
    decryptor: RwLock<Option<Arc<dyn Decryptor>>>,
    entries: Mutex<LruCache<(String, String), Slot>>,
    decrypt_calls: AtomicU64,
}

impl DecryptionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            decryptor: RwLock::new(None),
            entries: Mutex::new(LruCache::new(capacity)),
            decrypt_calls: AtomicU64::new(0),
        }
    }

    pub fn with_decryptor(self, decryptor: Arc<dyn Decryptor>) -> Self {
        *self.decryptor.write() = Some(decryptor);
        self
    }

    /// Switch the active signer (account change). Entries for other signers
    /// stay cached under their own key.
    pub fn set_decryptor(&self, decryptor: Option<Arc<dyn Decryptor>>) {
        *self.decryptor.write() = decryptor;
    }

    /// Plaintext for `event`, decrypting at most once per signer.
    ///
    /// `None` for kinds whose content is not ciphertext, when no decryptor
    /// is configured, or when decryption fails; a failed attempt leaves
    /// nothing behind and will be retried on the next call.
    pub async fn decrypted_view(&self, event: &Event) -> Option<Arc<str>> {
        if !event.known_kind().is_encrypted() {
            return None;
        }
        let decryptor = self.decryptor.read().clone()?;
        let signer = decryptor.signer_pubkey();
        let Some(counterparty) = counterparty(event, &signer) else {
            debug!("Event {} has no counterparty for {signer}", event.id);
            return None;
        };
        let key = (signer, event.id.clone());

        let slot = {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some(slot) => slot.clone(),
                None => {
                    let slot: Slot = Arc::new(OnceCell::new());
                    entries.put(key.clone(), slot.clone());
                    slot
                }
            }
        };

        let result = slot
            .get_or_try_init(|| async {
                let scheme = EncryptionScheme::detect(&event.content);
                self.decrypt_calls.fetch_add(1, Ordering::Relaxed);
                decryptor
                    .decrypt(&event.content, &counterparty, scheme)
                    .await
                    .map(Arc::<str>::from)
            })
            .await;

        match result {
            Ok(plaintext) => Some(plaintext.clone()),
            Err(e) => {
                debug!("Could not decrypt event {}: {e}", event.id);
                let mut entries = self.entries.lock();
                let stale = entries
                    .peek(&key)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized());
                if stale {
                    entries.pop(&key);
                }
                None
            }
        }
    }

    /// Cached plaintext without suspending or decrypting.
    pub fn cached_view(&self, event: &Event) -> Option<Arc<str>> {
        let signer = self.decryptor.read().as_ref()?.signer_pubkey();
        let mut entries = self.entries.lock();
        entries.get(&(signer, event.id.clone()))?.get().cloned()
    }

    /// Drop every signer's plaintext for an event.
    pub fn invalidate_event(&self, id: &str) {
        let mut entries = self.entries.lock();
        let keys: Vec<(String, String)> = entries
            .iter()
            .filter(|((_, event_id), _)| event_id == id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            entries.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times the decryptor has been invoked.
    pub fn decrypt_calls(&self) -> u64 {
        self.decrypt_calls.load(Ordering::Relaxed)
    }
}

impl Default for DecryptionCache {
    fn default() -> Self {
        Self::new(DEFAULT_DECRYPT_CACHE_CAPACITY)
    }
}
