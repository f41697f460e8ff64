//! Deterministic in-process rig for exercising a pull session.
//!
//! [`ScriptedPeer`] stands in for the wire: tests inject `changes`/`rev`/
//! `norev` traffic and read back the replies the pipeline produced.
//! [`CollectingDelegate`] records every notification. Waiting helpers poll
//! with a deadline instead of sleeping fixed amounts, so tests stay fast on
//! loaded machines.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::PullOptions;
use crate::core::{
    BlobDigest, Checkpoint, ErrorPayload, Limits, RemoteSequence, ReplicatedRev,
};
use crate::repl::{ActivityLevel, PullDelegate, PullStatus, Puller};
use crate::store::MemoryStore;
use crate::wire::{
    IncomingMessage, OutgoingMessage, Profile, ReplySender, Wire, WireError, WireResponse,
};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Route pipeline tracing through the test writer; `RUST_LOG` filters it.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Scripted remote peer implementing [`Wire`].
#[derive(Default)]
pub struct ScriptedPeer {
    requests: Mutex<Vec<OutgoingMessage>>,
    responses: Mutex<Vec<(u64, WireResponse)>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    sub_changes_error: Mutex<Option<ErrorPayload>>,
    connected: AtomicBool,
}

impl ScriptedPeer {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn add_blob(&self, digest: &str, body: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.to_string(), Bytes::copy_from_slice(body));
    }

    /// Make the next `subChanges` request fail with `error`.
    pub fn reject_sub_changes(&self, error: ErrorPayload) {
        *self.sub_changes_error.lock().unwrap() = Some(error);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Outgoing requests sent so far (e.g. the `subChanges` subscription).
    pub fn requests(&self) -> Vec<OutgoingMessage> {
        self.requests.lock().unwrap().clone()
    }

    /// Replies produced for delivered messages, in emission order.
    pub fn responses(&self) -> Vec<(u64, WireResponse)> {
        self.responses.lock().unwrap().clone()
    }

    /// Wait until the pipeline has replied to message `number`.
    pub fn wait_response(&self, number: u64, timeout: Duration) -> WireResponse {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((_, response)) = self
                .responses
                .lock()
                .unwrap()
                .iter()
                .find(|(replied, _)| *replied == number)
            {
                return response.clone();
            }
            assert!(
                Instant::now() < deadline,
                "no reply to message {number} within {timeout:?}"
            );
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Wire for ScriptedPeer {
    fn send_request(
        &self,
        msg: OutgoingMessage,
        reply: Option<ReplySender>,
    ) -> Result<(), WireError> {
        if !self.connected() {
            return Err(WireError::Disconnected);
        }
        let is_sub_changes = msg.profile == Some(Profile::SubChanges);
        self.requests.lock().unwrap().push(msg);
        if let Some(reply) = reply {
            let response = if is_sub_changes
                && let Some(error) = self.sub_changes_error.lock().unwrap().take()
            {
                WireResponse::Error(error)
            } else {
                WireResponse::Ok
            };
            let _ = reply.send(response);
        }
        Ok(())
    }

    fn respond(&self, request: u64, response: WireResponse) {
        self.responses.lock().unwrap().push((request, response));
    }

    fn fetch_blob(&self, digest: &BlobDigest) -> Result<Bytes, WireError> {
        if !self.connected() {
            return Err(WireError::Disconnected);
        }
        self.blobs
            .lock()
            .unwrap()
            .get(digest.as_str())
            .cloned()
            .ok_or(WireError::Timeout)
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Records every delegate callback for later assertions.
#[derive(Default)]
pub struct CollectingDelegate {
    documents: Mutex<Vec<ReplicatedRev>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
    statuses: Mutex<Vec<PullStatus>>,
}

impl CollectingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<ReplicatedRev> {
        self.documents.lock().unwrap().clone()
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<PullStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn wait_documents(&self, count: usize, timeout: Duration) -> Vec<ReplicatedRev> {
        let deadline = Instant::now() + timeout;
        loop {
            let documents = self.documents();
            if documents.len() >= count {
                return documents;
            }
            assert!(
                Instant::now() < deadline,
                "only {} of {count} document notifications within {timeout:?}",
                documents.len()
            );
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl PullDelegate for CollectingDelegate {
    fn document_ended(&self, rev: ReplicatedRev) {
        self.documents.lock().unwrap().push(rev);
    }

    fn checkpoint_changed(&self, checkpoint: &Checkpoint) {
        self.checkpoints.lock().unwrap().push(checkpoint.clone());
    }

    fn status_changed(&self, status: PullStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

/// A full pull session wired to a scripted peer and an in-memory store.
pub struct PullRig {
    pub peer: Arc<ScriptedPeer>,
    pub store: Arc<MemoryStore>,
    pub delegate: Arc<CollectingDelegate>,
    pub puller: Puller,
    next_message: AtomicU64,
}

impl PullRig {
    pub fn new(options: PullOptions, limits: Limits) -> Self {
        Self::with_store(options, limits, Arc::new(MemoryStore::new()))
    }

    /// Build a rig over an existing store, e.g. to resume from its
    /// checkpoint with a fresh session.
    pub fn with_store(options: PullOptions, limits: Limits, store: Arc<MemoryStore>) -> Self {
        init_tracing();
        let peer = Arc::new(ScriptedPeer::new());
        let delegate = Arc::new(CollectingDelegate::new());
        let puller = Puller::spawn(
            peer.clone(),
            store.clone(),
            delegate.clone(),
            options,
            limits,
        );
        Self {
            peer,
            store,
            delegate,
            puller,
            next_message: AtomicU64::new(1),
        }
    }

    fn next_number(&self) -> u64 {
        self.next_message.fetch_add(1, Ordering::SeqCst)
    }

    /// Deliver a raw request to the puller; returns its message number.
    pub fn deliver(&self, profile: Profile, properties: &[(&str, &str)], body: &[u8]) -> u64 {
        let number = self.next_number();
        let properties: BTreeMap<String, String> = properties
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.puller.deliver(IncomingMessage {
            number,
            profile,
            properties,
            body: Bytes::copy_from_slice(body),
            no_reply: false,
        });
        number
    }

    /// Deliver a `changes` advertisement; `entries` is the JSON tuple array.
    pub fn deliver_changes(&self, entries: serde_json::Value) -> u64 {
        self.deliver(
            Profile::Changes,
            &[],
            &serde_json::to_vec(&entries).unwrap(),
        )
    }

    pub fn deliver_propose_changes(&self, entries: serde_json::Value) -> u64 {
        self.deliver(
            Profile::ProposeChanges,
            &[],
            &serde_json::to_vec(&entries).unwrap(),
        )
    }

    pub fn deliver_rev(&self, doc: &str, rev: &str, sequence: &str, body: &[u8]) -> u64 {
        self.deliver(
            Profile::Rev,
            &[("id", doc), ("rev", rev), ("sequence", sequence)],
            body,
        )
    }

    pub fn deliver_rev_with_history(
        &self,
        doc: &str,
        rev: &str,
        sequence: &str,
        history: &str,
        body: &[u8],
    ) -> u64 {
        self.deliver(
            Profile::Rev,
            &[
                ("id", doc),
                ("rev", rev),
                ("sequence", sequence),
                ("history", history),
            ],
            body,
        )
    }

    pub fn deliver_norev(&self, doc: &str, sequence: &str) -> u64 {
        self.deliver(Profile::NoRev, &[("id", doc), ("sequence", sequence)], b"")
    }

    pub fn wait_level(&self, level: ActivityLevel, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.puller.status().level == level {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "activity level never reached {level:?} within {timeout:?} (now {:?})",
                self.puller.status().level
            );
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait until the persisted checkpoint records `sequence`.
    pub fn wait_checkpoint(&self, sequence: &RemoteSequence, timeout: Duration) -> Checkpoint {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(checkpoint) = self
                .delegate
                .checkpoints()
                .into_iter()
                .rev()
                .find(|checkpoint| &checkpoint.last_sequence == sequence)
            {
                return checkpoint;
            }
            assert!(
                Instant::now() < deadline,
                "checkpoint never reached {sequence} within {timeout:?}"
            );
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
