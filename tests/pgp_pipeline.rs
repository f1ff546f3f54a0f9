//! End-to-end pipeline tests with real OpenPGP keys.
//!
//! Each test builds a key directory in a tempdir from the fixture keys
//! under `tests/fixtures/`, runs a message through the pipeline with the
//! rpgp engine, and inspects what reached the dispatcher.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pgp::{Deserializable, Message, SignedPublicKey, SignedSecretKey};
use tempfile::TempDir;

use pgp_sendmail::config::RelayConfig;
use pgp_sendmail::crypto::RpgpEngine;
use pgp_sendmail::delivery::{DeliveryResult, Dispatcher, ResultStream};
use pgp_sendmail::envelope::Envelope;
use pgp_sendmail::error::{Error, InputError, KeyStoreError};
use pgp_sendmail::keystore::{FsKeyStore, KeyMaterial, KeyStore, address_hash};
use pgp_sendmail::pipeline::{InboundMessage, Pipeline, Submission};

const BOB: &str = "bob@example.com";
const ALICE: &str = "alice@example.com";

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read_to_string(path).unwrap()
}

/// Write `content` as `<md5(address)>.<ext>` into the key directory.
fn install(dir: &TempDir, address: &str, ext: &str, content: &str) {
    let path = dir.path().join(format!("{}.{ext}", address_hash(address)));
    std::fs::write(path, content).unwrap();
}

// ── Test doubles ────────────────────────────────────────────────────

/// Filesystem key store that counts every access.
struct CountingKeys {
    inner: FsKeyStore,
    reads: AtomicUsize,
}

impl KeyStore for CountingKeys {
    fn lookup(&self, address: &str) -> Result<Option<KeyMaterial>, KeyStoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(address)
    }

    fn private_key(&self, address: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.private_key(address)
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, envelope: Envelope) -> ResultStream {
        self.sent.lock().unwrap().push(envelope);
        Box::pin(futures::stream::iter(vec![DeliveryResult::info("recorded")]))
    }
}

struct Harness {
    _dir: TempDir,
    keys: Arc<CountingKeys>,
    dispatcher: Arc<RecordingDispatcher>,
    pipeline: Pipeline,
}

impl Harness {
    fn new(dir: TempDir, vars: &[(&str, &str)], allowed_domains: &[&str]) -> Self {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = RelayConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
        config.key_dir = dir.path().to_path_buf();
        config.allowed_domains = allowed_domains.iter().map(|d| d.to_string()).collect();

        let keys = Arc::new(CountingKeys {
            inner: FsKeyStore::new(dir.path()),
            reads: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let pipeline = Pipeline::new(
            Arc::new(config),
            keys.clone(),
            Arc::new(RpgpEngine::new()),
            dispatcher.clone(),
        );
        Self {
            _dir: dir,
            keys,
            dispatcher,
            pipeline,
        }
    }

    fn sent_body(&self, index: usize) -> String {
        String::from_utf8(self.dispatcher.sent.lock().unwrap()[index].body.clone()).unwrap()
    }
}

fn hello_to_bob() -> Submission {
    Submission {
        sender: Some(ALICE.to_string()),
        recipients: vec![BOB.to_string()],
        subject: None,
        body: b"hello".to_vec(),
    }
}

/// The first armored PGP message inside `text`.
fn armored_block(text: &str) -> &str {
    const BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
    const END: &str = "-----END PGP MESSAGE-----";
    let start = text.find(BEGIN).expect("no armored message");
    let end = text[start..].find(END).expect("unterminated armor") + start + END.len();
    &text[start..end]
}

fn decrypt(armored: &str, key: &str, passphrase: &str) -> Message {
    let (key, _) = SignedSecretKey::from_string(key).unwrap();
    let (message, _) = Message::from_string(armored).unwrap();
    let passphrase = passphrase.to_string();
    let (decrypted, _) = message.decrypt(|| passphrase, &[&key]).unwrap();
    decrypted
}

fn content(message: &Message) -> Vec<u8> {
    message.get_content().unwrap().expect("message has no literal data")
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn no_key_files_send_plain_body() {
    let harness = Harness::new(TempDir::new().unwrap(), &[], &[]);

    let report = harness.pipeline.submit(hello_to_bob()).await.unwrap();

    assert!(!report.envelopes[0].encrypted);
    assert_eq!(harness.sent_body(0), "hello");
    let sent = harness.dispatcher.sent.lock().unwrap();
    assert_eq!(sent[0].recipients(), [BOB]);
}

#[tokio::test]
async fn public_key_without_policy_encrypts_for_recipient() {
    let dir = TempDir::new().unwrap();
    install(&dir, BOB, "pgp", &fixture("bob.pub.asc"));
    let harness = Harness::new(dir, &[], &[]);

    let report = harness.pipeline.submit(hello_to_bob()).await.unwrap();
    assert!(report.envelopes[0].encrypted);

    let body = harness.sent_body(0);
    assert!(body.contains("application/pgp-encrypted"));
    let message = decrypt(armored_block(&body), &fixture("bob.sec.asc"), "");
    assert_eq!(content(&message), b"hello");
}

#[tokio::test]
async fn marker_policy_with_sender_key_encrypts_and_signs() {
    let dir = TempDir::new().unwrap();
    install(&dir, BOB, "pgp", &fixture("bob.pub.asc"));
    install(&dir, BOB, "config", "...");
    install(&dir, ALICE, "privpgp", &fixture("alice.sec.asc"));
    let harness = Harness::new(
        dir,
        &[("SENDMAIL_SECRET", "hunter2"), ("SENDMAIL_SMART_LOGIN", ALICE)],
        &[],
    );

    harness.pipeline.submit(hello_to_bob()).await.unwrap();

    let body = harness.sent_body(0);
    let message = decrypt(armored_block(&body), &fixture("bob.sec.asc"), "");
    let (alice, _) = SignedPublicKey::from_string(&fixture("alice.pub.asc")).unwrap();
    message.verify(&alice).unwrap();
    assert_eq!(content(&message), b"hello");
}

#[tokio::test]
async fn sender_key_is_unused_without_signing_identity() {
    let dir = TempDir::new().unwrap();
    install(&dir, BOB, "pgp", &fixture("bob.pub.asc"));
    install(&dir, BOB, "config", "...");
    install(&dir, ALICE, "privpgp", &fixture("alice.sec.asc"));
    let harness = Harness::new(dir, &[("SENDMAIL_SECRET", "hunter2")], &[]);

    let report = harness.pipeline.submit(hello_to_bob()).await.unwrap();
    assert!(report.envelopes[0].encrypted);

    let body = harness.sent_body(0);
    let message = decrypt(armored_block(&body), &fixture("bob.sec.asc"), "");
    let (alice, _) = SignedPublicKey::from_string(&fixture("alice.pub.asc")).unwrap();
    assert!(message.verify(&alice).is_err());
    assert_eq!(content(&message), b"hello");
}

#[tokio::test]
async fn wrong_passphrase_aborts_the_message() {
    let dir = TempDir::new().unwrap();
    install(&dir, BOB, "pgp", &fixture("bob.pub.asc"));
    install(&dir, ALICE, "privpgp", &fixture("alice.sec.asc"));
    let harness = Harness::new(
        dir,
        &[("SENDMAIL_SECRET", "wrong"), ("SENDMAIL_SMART_LOGIN", ALICE)],
        &[],
    );

    let err = harness.pipeline.submit(hello_to_bob()).await.unwrap_err();

    assert!(matches!(err, Error::Crypto(_)), "{err}");
    assert!(harness.dispatcher.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn policy_without_marker_sends_plain_on_submission() {
    let dir = TempDir::new().unwrap();
    install(&dir, BOB, "pgp", &fixture("bob.pub.asc"));
    install(&dir, BOB, "config", "Quarterly report");
    let harness = Harness::new(dir, &[], &[]);

    let report = harness.pipeline.submit(hello_to_bob()).await.unwrap();

    assert!(!report.envelopes[0].encrypted);
    assert_eq!(harness.sent_body(0), "hello");
}

#[tokio::test]
async fn inbound_subject_match_wraps_twice() {
    let dir = TempDir::new().unwrap();
    install(&dir, BOB, "pgp", &fixture("bob.pub.asc"));
    install(&dir, BOB, "config", "Quarterly report");
    let harness = Harness::new(dir, &[], &[]);

    let data = b"From: alice@example.com\r\nTo: bob@example.com\r\n\
                 Subject: Quarterly report\r\n\r\nnumbers\r\n";
    harness
        .pipeline
        .relay(InboundMessage::new(ALICE, vec![BOB.to_string()], data.to_vec()))
        .await
        .unwrap();

    let body = harness.sent_body(0);
    let bob_secret = fixture("bob.sec.asc");
    let outer = decrypt(armored_block(&body), &bob_secret, "");
    let inner_armor = String::from_utf8(content(&outer)).unwrap();
    let inner = decrypt(armored_block(&inner_armor), &bob_secret, "");
    assert_eq!(content(&inner), data);
}

#[tokio::test]
async fn eight_bit_headers_pass_through_unencrypted() {
    let harness = Harness::new(TempDir::new().unwrap(), &[], &[]);

    let data = b"From: alice@example.com\r\nTo: bob@example.com\r\n\
                 Subject: Caf\xe9 order\r\nX-Note: na\xefve\r\n\r\nhi";
    let report = harness
        .pipeline
        .submit(Submission {
            sender: Some(ALICE.to_string()),
            recipients: vec![BOB.to_string()],
            subject: None,
            body: data.to_vec(),
        })
        .await
        .unwrap();
    assert!(!report.envelopes[0].encrypted);

    let sent = harness.dispatcher.sent.lock().unwrap();
    assert_eq!(sent[0].body, b"hi");
    let wire = sent[0].to_bytes().unwrap();
    let has = |needle: &[u8]| wire.windows(needle.len()).any(|w| w == needle);
    assert!(wire.starts_with(b"From: alice@example.com\r\n"));
    assert!(has(b"\r\nSubject: Caf\xe9 order\r\n"));
    assert!(has(b"\r\nX-Note: na\xefve\r\n"));
    assert!(wire.ends_with(b"\r\n\r\nhi"));
}

#[tokio::test]
async fn eight_bit_headers_do_not_hide_the_subject_trigger() {
    let dir = TempDir::new().unwrap();
    install(&dir, BOB, "pgp", &fixture("bob.pub.asc"));
    install(&dir, BOB, "config", "Quarterly report");
    let harness = Harness::new(dir, &[], &[]);

    let data = b"From: alice@example.com\r\nX-Note: na\xefve\r\n\
                 Subject: Quarterly report\r\n\r\nnumbers";
    let report = harness
        .pipeline
        .relay(InboundMessage::new(ALICE, vec![BOB.to_string()], data.to_vec()))
        .await
        .unwrap();
    assert!(report.envelopes[0].encrypted);

    let body = harness.sent_body(0);
    let bob_secret = fixture("bob.sec.asc");
    let outer = decrypt(armored_block(&body), &bob_secret, "");
    let inner_armor = String::from_utf8(content(&outer)).unwrap();
    let inner = decrypt(armored_block(&inner_armor), &bob_secret, "");
    assert_eq!(content(&inner), data);
}

#[tokio::test]
async fn disallowed_sender_is_rejected_without_key_reads() {
    let dir = TempDir::new().unwrap();
    install(&dir, BOB, "pgp", &fixture("bob.pub.asc"));
    let harness = Harness::new(dir, &[], &["example.com"]);

    let mut submission = hello_to_bob();
    submission.sender = Some("alice@other.com".to_string());
    let err = harness.pipeline.submit(submission).await.unwrap_err();

    assert!(matches!(err, Error::Authorization(_)));
    assert_eq!(harness.keys.reads.load(Ordering::SeqCst), 0);
    assert!(harness.dispatcher.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_recipients_are_rejected_before_key_reads() {
    let harness = Harness::new(TempDir::new().unwrap(), &[], &[]);

    let mut submission = hello_to_bob();
    submission.recipients.clear();
    let err = harness.pipeline.submit(submission).await.unwrap_err();

    assert!(matches!(err, Error::Input(InputError::EmptyRecipients)));
    assert_eq!(harness.keys.reads.load(Ordering::SeqCst), 0);
}
