//! Event authentication: canonical id hashing and BIP-340 Schnorr signatures.
//!
//! Every event that enters the local view passes through [`verify`] first.
//! Failures are counted in [`VerifyMetrics`] and dropped by the caller; they
//! are never surfaced per event.

use crate::event::{Event, EventTemplate};
use secp256k1::{schnorr, All, Keypair, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// Counters for authentication outcomes.
#[derive(Debug, Default)]
pub struct VerifyMetrics {
    pub verified: AtomicU64,
    pub rejected: AtomicU64,
}

impl VerifyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ok: bool) {
        let counter = if ok { &self.verified } else { &self.rejected };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.verified.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

/// Compact JSON array `[0, pubkey, created_at, kind, tags, content]`.
pub fn canonical_json(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content)).unwrap_or_default()
}

fn digest(pubkey: &str, created_at: u64, kind: u16, tags: &[Vec<String>], content: &str) -> [u8; 32] {
    let canonical = canonical_json(pubkey, created_at, kind, tags, content);
    Sha256::digest(canonical.as_bytes()).into()
}

/// Lowercase hex id for the given event fields.
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    hex::encode(digest(pubkey, created_at, kind, tags, content))
}

/// True when the id matches the canonical hash and, if a signature is
/// present, the signature is valid for `pubkey` over the id bytes.
///
/// Never panics: malformed hex or wrong-length keys simply yield `false`.
pub fn verify(event: &Event) -> bool {
    if !is_lower_hex(&event.pubkey, 64) || !is_lower_hex(&event.id, 64) {
        return false;
    }
    let id = digest(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    );
    if hex::encode(id) != event.id {
        return false;
    }
    if event.sig.is_empty() {
        return true;
    }
    verify_signature(&id, &event.pubkey, &event.sig)
}

fn verify_signature(id: &[u8; 32], pubkey: &str, sig: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(sig) else {
        return false;
    };
    let Ok(pk_bytes) = hex::decode(pubkey) else {
        return false;
    };
    let Ok(signature) = schnorr::Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let Ok(public_key) = XOnlyPublicKey::from_slice(&pk_bytes) else {
        return false;
    };
    let message = Message::from_digest(*id);
    SECP.verify_schnorr(&signature, &message, &public_key).is_ok()
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Build a keypair from 32 secret bytes. `None` if the bytes are not a
/// valid secp256k1 scalar.
pub fn keypair_from_secret(secret: &[u8]) -> Option<Keypair> {
    Keypair::from_seckey_slice(&SECP, secret).ok()
}

/// Hex x-only public key of a keypair.
pub fn public_key_hex(keypair: &Keypair) -> String {
    keypair.x_only_public_key().0.to_string()
}

/// Sign a template, producing an event that passes [`verify`].
pub fn sign(template: EventTemplate, keypair: &Keypair) -> Event {
    let pubkey = public_key_hex(keypair);
    let id = digest(
        &pubkey,
        template.created_at,
        template.kind,
        &template.tags,
        &template.content,
    );
    let sig = SECP.sign_schnorr_no_aux_rand(&Message::from_digest(id), keypair);
    Event {
        id: hex::encode(id),
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags,
        content: template.content,
        sig: sig.to_string(),
    }
}

/// Build an unsigned event (a rumor) whose id is still correct.
pub fn unsigned(template: EventTemplate, pubkey: &str) -> Event {
    let id = compute_id(
        pubkey,
        template.created_at,
        template.kind,
        &template.tags,
        &template.content,
    );
    Event {
        id,
        pubkey: pubkey.to_string(),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags,
        content: template.content,
        sig: String::new(),
    }
}
