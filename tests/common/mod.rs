#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use proposal_lifecycle::clock::ManualClock;
use proposal_lifecycle::config::Config;
use proposal_lifecycle::error::ExternalError;
use proposal_lifecycle::outbound::{
    Anchor, AnchorReceipt, LifecycleNotice, Mailer, Notifier, OutboundMessage,
};
use proposal_lifecycle::service::{DocumentService, SendReceipt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

static TRACING: Once = Once::new();

/// Install a subscriber once per test binary, filtered by RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub failing: AtomicBool,
    // accept this many messages, then fail every later one
    pub limit: Mutex<Option<usize>>,
}

impl RecordingMailer {
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_after(&self, accepted: usize) {
        *self.limit.lock().unwrap() = Some(accepted);
    }
}

impl Mailer for RecordingMailer {
    fn dispatch(&self, message: &OutboundMessage, timeout: Duration) -> Result<(), ExternalError> {
        let mut sent = self.sent.lock().unwrap();
        let over_limit = self
            .limit
            .lock()
            .unwrap()
            .is_some_and(|limit| sent.len() >= limit);
        if self.failing.load(Ordering::SeqCst) || over_limit {
            return Err(ExternalError::Timeout {
                service: "mailer",
                timeout_secs: timeout.as_secs(),
            });
        }
        sent.push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<LifecycleNotice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<LifecycleNotice> {
        self.notices.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: &LifecycleNotice, _: Duration) -> Result<(), ExternalError> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// In-memory ledger standing in for a chain.
#[derive(Default)]
pub struct MemoryAnchor {
    pub anchored: Mutex<HashMap<String, Vec<u8>>>,
}

impl Anchor for MemoryAnchor {
    fn anchor(&self, verification_hash: &[u8], _: Duration) -> Result<AnchorReceipt, ExternalError> {
        let mut anchored = self.anchored.lock().unwrap();
        let tx_hash = format!("0x{:04x}", anchored.len() + 1);
        anchored.insert(tx_hash.clone(), verification_hash.to_vec());
        Ok(AnchorReceipt { tx_hash })
    }

    fn confirm(
        &self,
        verification_hash: &[u8],
        tx_hash: &str,
        _: Duration,
    ) -> Result<bool, ExternalError> {
        let anchored = self.anchored.lock().unwrap();
        Ok(anchored
            .get(tx_hash)
            .is_some_and(|hash| hash.as_slice() == verification_hash))
    }
}

pub struct Harness {
    pub service: Arc<DocumentService>,
    pub clock: Arc<ManualClock>,
    pub mailer: Arc<RecordingMailer>,
    pub notifier: Arc<RecordingNotifier>,
    pub anchor: Arc<MemoryAnchor>,
    // held so the database outlives the test body
    _dir: TempDir,
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

pub fn harness(name: &str) -> anyhow::Result<Harness> {
    harness_with(name, Config::default())
}

pub fn harness_with(name: &str, config: Config) -> anyhow::Result<Harness> {
    init_tracing();

    // Sled locks its files, every test gets its own database under a temp dir.
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join(format!("{name}.db")))?;

    let clock = Arc::new(ManualClock::new(start()));
    let mailer = Arc::new(RecordingMailer::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let anchor = Arc::new(MemoryAnchor::default());

    let service = DocumentService::new(Arc::new(db), config)?
        .with_clock(clock.clone())
        .with_mailer(mailer.clone())
        .with_notifier(notifier.clone())
        .with_anchor(anchor.clone());

    Ok(Harness {
        service: Arc::new(service),
        clock,
        mailer,
        notifier,
        anchor,
        _dir: temp_dir,
    })
}

/// Token part of a signing URL.
pub fn token_of(url: &str) -> String {
    url.rsplit('/').next().unwrap_or_default().to_string()
}

/// Tokens of a send receipt, in roster order.
pub fn tokens(receipt: &SendReceipt) -> Vec<String> {
    receipt.links.iter().map(|l| token_of(&l.url)).collect()
}
