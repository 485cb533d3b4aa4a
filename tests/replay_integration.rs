//! End-to-end replay of captured relay traffic through the view.

use nostr_core::event::{KIND_ENCRYPTED_DM, KIND_REACTION, KIND_TEXT_NOTE};
use nostr_core::nostr_sdk::prelude::{nip44, Keys};
use nostr_core::verify::{keypair_from_secret, public_key_hex, sign};
use nostr_core::{Event, EventTemplate};
use nostr_view::{replay, Config, ReplayOptions};
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;

const ALICE: [u8; 32] = [0x11; 32];
const BOB: [u8; 32] = [0x22; 32];
const CAROL: [u8; 32] = [0x33; 32];

fn signed(secret: &[u8; 32], template: EventTemplate) -> Event {
    let keypair = keypair_from_secret(secret).unwrap();
    sign(template, &keypair)
}

fn pubkey(secret: &[u8; 32]) -> String {
    public_key_hex(&keypair_from_secret(secret).unwrap())
}

fn event_line(relay: &str, event: &Event) -> String {
    let event: serde_json::Value = serde_json::from_str(&event.as_json()).unwrap();
    json!({ "relay": relay, "message": ["EVENT", "capture", event] }).to_string()
}

fn write_capture(lines: &[String]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    file.flush().unwrap();
    file
}

fn options() -> ReplayOptions {
    ReplayOptions {
        now: Some(2_000),
        skip_trim: false,
    }
}

#[tokio::test]
async fn replay_verifies_dedups_and_trims() {
    let note = signed(&ALICE, EventTemplate::new(KIND_TEXT_NOTE, 1_000, "hello"));
    let mut forged = signed(&ALICE, EventTemplate::new(KIND_TEXT_NOTE, 1_001, "real"));
    forged.content = "forged".into();
    let article_new = signed(&ALICE, EventTemplate::new(30_023, 100, "v2").tag(["d", "post"]));
    let article_old = signed(&ALICE, EventTemplate::new(30_023, 90, "v1").tag(["d", "post"]));
    let stranger_reaction = signed(
        &CAROL,
        EventTemplate::new(KIND_REACTION, 1_002, "+").tag(["e", note.id.as_str()]),
    );
    let account_reply = signed(
        &BOB,
        EventTemplate::new(KIND_TEXT_NOTE, 1_003, "reply").tag(["e", note.id.as_str()]),
    );

    let capture = write_capture(&[
        event_line("relay.example.com", &note),
        event_line("wss://RELAY.example.com/", &note),
        event_line("relay.example.com", &forged),
        event_line("relay.example.com", &article_new),
        event_line("nos.lol", &article_old),
        event_line("nos.lol", &stranger_reaction),
        event_line("nos.lol", &account_reply),
        json!({ "relay": "nos.lol", "message": ["NOTICE", "slow down"] }).to_string(),
        json!({ "relay": "nos.lol", "message": ["EOSE", "capture"] }).to_string(),
        "this is not json".to_string(),
        String::new(),
    ]);

    let mut config = Config::default();
    config.retention.accounts.push(pubkey(&BOB));

    let summary = replay(&config, capture.path(), &options()).await.unwrap();

    assert_eq!(summary.lines, 11);
    assert_eq!(summary.messages.added, 4);
    assert_eq!(summary.messages.duplicate, 1);
    assert_eq!(summary.messages.rejected, 1);
    assert_eq!(summary.messages.superseded, 1);
    assert_eq!(summary.messages.notice, 1);
    assert_eq!(summary.messages.eose, 1);
    assert_eq!(summary.messages.malformed, 1);
    assert_eq!(summary.verify_failures, 1);

    let trim = summary.trim.unwrap();
    assert_eq!(trim.replies_and_reactions, 1);
    assert_eq!(trim.superseded_versions, 1);
    assert_eq!(summary.store.events, 3);
    assert_eq!(summary.store.superseded, 0);
    assert_eq!(summary.store.addressables, 1);
}

#[tokio::test]
async fn queries_are_subscribed_and_closed_on_shutdown() {
    let author = pubkey(&ALICE);
    let config = Config::from_toml(&format!(
        r#"
        [[queries]]
        group = "home"
        key = "profile"
        relays = ["relay.example.com", "nos.lol"]
        filter = {{ kinds = [0], authors = ["{author}"] }}

        [[queries]]
        group = "home"
        key = "notes"
        relays = ["relay.example.com"]
        filter = {{ kinds = [1], authors = ["{author}"] }}
        "#
    ))
    .unwrap();
    config.validate().unwrap();

    let capture = write_capture(&[]);
    let summary = replay(&config, capture.path(), &options()).await.unwrap();

    assert_eq!(summary.lines, 0);
    // Both relays get a REQ; the second key re-issues relay.example.com with
    // the merged filter. Shutdown then closes both.
    assert_eq!(summary.reqs_sent, 3);
    assert_eq!(summary.closes_sent, 3);
}

#[tokio::test]
async fn identity_decrypts_direct_messages() {
    let alice = Keys::parse(&hex_secret(&ALICE)).unwrap();
    let bob = Keys::parse(&hex_secret(&BOB)).unwrap();
    let ciphertext = nip44::encrypt(
        alice.secret_key(),
        &bob.public_key(),
        "see you at noon",
        nip44::Version::V2,
    )
    .unwrap();
    let dm = signed(
        &ALICE,
        EventTemplate::new(KIND_ENCRYPTED_DM, 1_500, ciphertext).tag(["p", pubkey(&BOB).as_str()]),
    );

    let mut identity = NamedTempFile::new().unwrap();
    write!(identity, "{}", json!({ "nsec": hex_secret(&BOB) })).unwrap();
    identity.flush().unwrap();

    let config = Config::from_toml(&format!(
        "[identity]\nnsec_file = {:?}\n",
        identity.path().display().to_string()
    ))
    .unwrap();

    let capture = write_capture(&[event_line("relay.example.com", &dm)]);
    let summary = replay(&config, capture.path(), &options()).await.unwrap();

    assert_eq!(summary.messages.added, 1);
    assert_eq!(summary.decrypted, 1);
}

#[tokio::test]
async fn missing_capture_is_an_error() {
    let config = Config::default();
    let result = replay(
        &config,
        std::path::Path::new("/nonexistent/capture.jsonl"),
        &options(),
    )
    .await;
    assert!(result.is_err());
}

fn hex_secret(secret: &[u8; 32]) -> String {
    secret.iter().map(|b| format!("{b:02x}")).collect()
}
