//! Event record, kind taxonomy and tag accessors.
//!
//! Events are immutable once parsed. Everything the store needs to know about
//! an event (its class, its replaceable address, who it references, when it
//! expires) is derived from the fields here and never cached on the event.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

// ── Kind numbers ────────────────────────────────────────────────

pub const KIND_METADATA: u16 = 0;
pub const KIND_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACT_LIST: u16 = 3;
pub const KIND_ENCRYPTED_DM: u16 = 4;
pub const KIND_DELETION: u16 = 5;
pub const KIND_REPOST: u16 = 6;
pub const KIND_REACTION: u16 = 7;
pub const KIND_SEAL: u16 = 13;
pub const KIND_CHAT_MESSAGE: u16 = 14;
pub const KIND_GENERIC_REPOST: u16 = 16;
pub const KIND_GIFT_WRAP: u16 = 1059;
pub const KIND_REPORT: u16 = 1984;
pub const KIND_ZAP_REQUEST: u16 = 9734;
pub const KIND_ZAP: u16 = 9735;
pub const KIND_RELAY_LIST: u16 = 10002;
pub const KIND_DRAFT: u16 = 31234;

/// A signed Nostr event as delivered by a relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// Lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    /// Lowercase hex Schnorr signature; empty for unsigned rumors
    #[serde(default)]
    pub sig: String,
}

/// The signable part of an event, before the author key is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, created_at: u64, content: impl Into<String>) -> Self {
        Self {
            created_at,
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append a tag (`["name", values...]`).
    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(parts.into_iter().map(Into::into).collect());
        self
    }
}

/// Storage semantics of a kind, per NIP-01 ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
    Regular,
    /// Latest per `(kind, pubkey)`
    Replaceable,
    /// Never stored
    Ephemeral,
    /// Latest per `(kind, pubkey, d)`
    Addressable,
}

impl KindClass {
    pub fn of(kind: u16) -> Self {
        match kind {
            KIND_METADATA | KIND_CONTACT_LIST => Self::Replaceable,
            10000..=19999 => Self::Replaceable,
            20000..=29999 => Self::Ephemeral,
            30000..=39999 => Self::Addressable,
            _ => Self::Regular,
        }
    }

    pub fn is_versioned(self) -> bool {
        matches!(self, Self::Replaceable | Self::Addressable)
    }
}

/// Kinds the core treats specially. Anything else is `Unknown` and handled
/// purely by its [`KindClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownKind {
    Metadata,
    TextNote,
    ContactList,
    EncryptedDirectMessage,
    Deletion,
    Repost,
    Reaction,
    Seal,
    ChatMessage,
    GenericRepost,
    GiftWrap,
    Report,
    ZapRequest,
    Zap,
    RelayList,
    Draft,
    Unknown(u16),
}

impl From<u16> for KnownKind {
    fn from(kind: u16) -> Self {
        match kind {
            KIND_METADATA => Self::Metadata,
            KIND_TEXT_NOTE => Self::TextNote,
            KIND_CONTACT_LIST => Self::ContactList,
            KIND_ENCRYPTED_DM => Self::EncryptedDirectMessage,
            KIND_DELETION => Self::Deletion,
            KIND_REPOST => Self::Repost,
            KIND_REACTION => Self::Reaction,
            KIND_SEAL => Self::Seal,
            KIND_CHAT_MESSAGE => Self::ChatMessage,
            KIND_GENERIC_REPOST => Self::GenericRepost,
            KIND_GIFT_WRAP => Self::GiftWrap,
            KIND_REPORT => Self::Report,
            KIND_ZAP_REQUEST => Self::ZapRequest,
            KIND_ZAP => Self::Zap,
            KIND_RELAY_LIST => Self::RelayList,
            KIND_DRAFT => Self::Draft,
            other => Self::Unknown(other),
        }
    }
}

impl KnownKind {
    /// Private messages whose content is only readable after decryption.
    pub fn is_direct_message(self) -> bool {
        matches!(
            self,
            Self::EncryptedDirectMessage | Self::ChatMessage | Self::Seal | Self::GiftWrap
        )
    }

    /// Whether the content of this kind is ciphertext addressed to someone.
    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            Self::EncryptedDirectMessage | Self::Seal | Self::GiftWrap | Self::Draft
        )
    }
}

// ── Addresses ───────────────────────────────────────────────────

/// Identity of a replaceable (`d` empty) or addressable event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventAddress {
    pub kind: u16,
    pub pubkey: String,
    pub d: String,
}

impl EventAddress {
    pub fn new(kind: u16, pubkey: impl Into<String>, d: impl Into<String>) -> Self {
        Self {
            kind,
            pubkey: pubkey.into(),
            d: d.into(),
        }
    }

    pub fn replaceable(kind: u16, pubkey: impl Into<String>) -> Self {
        Self::new(kind, pubkey, "")
    }
}

impl fmt::Display for EventAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.d)
    }
}

impl FromStr for EventAddress {
    type Err = ();

    /// Parses `kind:pubkey:d`. The `d` part may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next().ok_or(())?.parse::<u16>().map_err(|_| ())?;
        let pubkey = parts.next().ok_or(())?;
        if pubkey.len() != 64 || !pubkey.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(());
        }
        let d = parts.next().unwrap_or("");
        Ok(Self::new(kind, pubkey.to_ascii_lowercase(), d))
    }
}

// ── Tag accessors ───────────────────────────────────────────────

impl Event {
    /// Parse an event from relay JSON. Structural only; see [`crate::verify`].
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    pub fn known_kind(&self) -> KnownKind {
        KnownKind::from(self.kind)
    }

    /// Values of every tag named `name` (the second element of each tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| match (t.first(), t.get(1)) {
            (Some(tag), Some(value)) if tag == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// The `d` identifier, empty when absent.
    pub fn d_tag(&self) -> &str {
        self.first_tag_value("d").unwrap_or("")
    }

    /// The replaceable/addressable key, `None` for regular and ephemeral kinds.
    pub fn address(&self) -> Option<EventAddress> {
        match self.class() {
            KindClass::Replaceable => Some(EventAddress::replaceable(self.kind, &self.pubkey)),
            KindClass::Addressable => Some(EventAddress::new(self.kind, &self.pubkey, self.d_tag())),
            KindClass::Regular | KindClass::Ephemeral => None,
        }
    }

    /// NIP-40 expiration timestamp.
    pub fn expiration(&self) -> Option<u64> {
        self.first_tag_value("expiration")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration().is_some_and(|exp| exp < now)
    }

    pub fn referenced_event_ids(&self) -> impl Iterator<Item = &str> {
        self.tag_values("e")
    }

    pub fn referenced_pubkeys(&self) -> impl Iterator<Item = &str> {
        self.tag_values("p")
    }

    pub fn referenced_addresses(&self) -> impl Iterator<Item = EventAddress> + '_ {
        self.tag_values("a").filter_map(|v| v.parse().ok())
    }

    /// True when this event points at a parent (NIP-10 `e` tags that are not
    /// plain mentions, or NIP-22 `E`/`A` roots).
    pub fn is_reply(&self) -> bool {
        self.tags.iter().any(|t| match t.first().map(String::as_str) {
            Some("e") => t.get(3).map(String::as_str) != Some("mention"),
            Some("E") | Some("A") => true,
            _ => false,
        })
    }

    pub fn tags_any_pubkey(&self, pubkeys: &HashSet<String>) -> bool {
        self.referenced_pubkeys().any(|p| pubkeys.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u16, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "00".repeat(32),
            pubkey: "ab".repeat(32),
            created_at: 100,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn kind_classes_follow_ranges() {
        assert_eq!(KindClass::of(0), KindClass::Replaceable);
        assert_eq!(KindClass::of(1), KindClass::Regular);
        assert_eq!(KindClass::of(3), KindClass::Replaceable);
        assert_eq!(KindClass::of(10002), KindClass::Replaceable);
        assert_eq!(KindClass::of(20001), KindClass::Ephemeral);
        assert_eq!(KindClass::of(30023), KindClass::Addressable);
        assert_eq!(KindClass::of(40000), KindClass::Regular);
    }

    #[test]
    fn known_kind_falls_back_to_unknown() {
        assert_eq!(KnownKind::from(7), KnownKind::Reaction);
        assert_eq!(KnownKind::from(4242), KnownKind::Unknown(4242));
        assert!(KnownKind::from(1059).is_direct_message());
        assert!(!KnownKind::from(1).is_direct_message());
    }

    #[test]
    fn addressable_event_uses_d_tag() {
        let e = event(30023, vec![vec!["d", "my-article"]]);
        let addr = e.address().unwrap();
        assert_eq!(addr.d, "my-article");
        assert_eq!(addr.kind, 30023);

        let no_d = event(30023, vec![]);
        assert_eq!(no_d.address().unwrap().d, "");
        assert!(event(1, vec![]).address().is_none());
    }

    #[test]
    fn address_text_form_roundtrips() {
        let addr = EventAddress::new(30023, "ab".repeat(32), "with:colon");
        let parsed: EventAddress = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert!("30023:nothex:x".parse::<EventAddress>().is_err());
        assert!("kind:abc".parse::<EventAddress>().is_err());
    }

    #[test]
    fn first_tag_value_skips_tags_without_values() {
        let e = event(30023, vec![vec!["d"], vec!["d", "second"], vec!["d", "third"]]);
        let name = String::from("d");
        let value = e.first_tag_value(&name);
        drop(name);
        assert_eq!(value, Some("second"));
        assert_eq!(e.d_tag(), "second");
        assert_eq!(e.first_tag_value("title"), None);
    }

    #[test]
    fn expiration_parsing() {
        let e = event(1, vec![vec!["expiration", "150"]]);
        assert_eq!(e.expiration(), Some(150));
        assert!(e.is_expired(151));
        assert!(!e.is_expired(150));
        assert!(!event(1, vec![vec!["expiration", "soon"]]).is_expired(u64::MAX));
    }

    #[test]
    fn reply_detection_ignores_mentions() {
        assert!(event(1, vec![vec!["e", "x", "", "reply"]]).is_reply());
        assert!(event(1, vec![vec!["e", "x"]]).is_reply());
        assert!(!event(1, vec![vec!["e", "x", "", "mention"]]).is_reply());
        assert!(!event(1, vec![vec!["p", "x"]]).is_reply());
    }

    #[test]
    fn event_json_without_optional_fields_parses() {
        let json = format!(
            r#"{{"id":"{}","pubkey":"{}","created_at":1,"kind":1}}"#,
            "00".repeat(32),
            "ab".repeat(32)
        );
        let e = Event::from_json(&json).unwrap();
        assert!(e.tags.is_empty());
        assert!(e.sig.is_empty());
    }
}
