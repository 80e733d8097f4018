//! In-memory doubles for the PTY, the peer transport and the viewer screen.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use termshare::network::{
    ChannelKind, DataChannel, PeerTransport, TransportEvent, TransportFactory,
};
use termshare::protocol::{Envelope, ProtocolError, Result, WindowSize};
use termshare::pty::{PtyDevice, PtyError};
use termshare::viewer::Screen;
use tokio::sync::mpsc;

/// Polls `check` until it holds or two seconds pass.
pub async fn wait_until<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    eventually(|| std::future::ready(check())).await
}

/// Like [`wait_until`], for checks that need to await.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// --- PTY ---

pub struct MockPty {
    written: Mutex<Vec<u8>>,
    size: Mutex<WindowSize>,
    refreshes: AtomicUsize,
    /// Writes one byte at a time, yielding in between, like a short-writing fd.
    trickle: AtomicBool,
}

impl MockPty {
    pub fn new(size: WindowSize) -> Arc<Self> {
        Arc::new(Self {
            written: Mutex::new(Vec::new()),
            size: Mutex::new(size),
            refreshes: AtomicUsize::new(0),
            trickle: AtomicBool::new(false),
        })
    }

    pub fn set_trickle(&self, trickle: bool) {
        self.trickle.store(trickle, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl PtyDevice for MockPty {
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), PtyError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.trickle.load(Ordering::SeqCst) {
                self.written.lock().unwrap().extend_from_slice(data);
                return Ok(());
            }
            for byte in data {
                self.written.lock().unwrap().push(*byte);
                tokio::task::yield_now().await;
            }
            Ok(())
        })
    }

    fn size(&self) -> WindowSize {
        *self.size.lock().unwrap()
    }

    fn resize(
        &self,
        size: WindowSize,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), PtyError>> + Send + '_>> {
        Box::pin(async move {
            *self.size.lock().unwrap() = size;
            Ok(())
        })
    }

    fn refresh(&self) -> Pin<Box<dyn Future<Output = std::result::Result<(), PtyError>> + Send + '_>> {
        Box::pin(async move {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

// --- Data channels ---

pub struct MockChannel {
    kind: ChannelKind,
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    failing: AtomicBool,
}

impl MockChannel {
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Everything sent, concatenated.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent().concat()
    }

    /// Every message sent, decoded as envelopes.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .iter()
            .map(|bytes| Envelope::decode(bytes).unwrap())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DataChannel for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.is_closed() || self.failing.load(Ordering::SeqCst) {
                return Err(ProtocolError::TransferFailed("channel unavailable".to_string()));
            }
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

// --- Transport ---

pub const MOCK_OFFER: &str = "{\"type\":\"offer\",\"sdp\":\"mock\"}";
pub const MOCK_ANSWER: &str = "{\"type\":\"answer\",\"sdp\":\"mock\"}";
/// A description the mock transport refuses.
pub const BAD_DESCRIPTION: &str = "not a description";

pub struct MockTransport {
    events: mpsc::Sender<TransportEvent>,
    remote: Mutex<Option<String>>,
    candidates: Mutex<Vec<String>>,
    created: Mutex<Vec<ChannelKind>>,
    closed: AtomicBool,
    /// Gathers a local candidate while the answer is being created.
    early_candidate: bool,
}

/// The candidate an early-gathering transport reports.
pub const EARLY_CANDIDATE: &str = "{\"candidate\":\"early\"}";

impl MockTransport {
    /// Reports an event as the real transport would from a callback.
    pub async fn emit(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    /// Opens a sub-channel from the remote side and returns it.
    pub async fn open_channel(&self, kind: ChannelKind) -> Arc<MockChannel> {
        let channel = MockChannel::new(kind);
        self.emit(TransportEvent::ChannelOpen(channel.clone())).await;
        channel
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn created_channels(&self) -> Vec<ChannelKind> {
        self.created.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PeerTransport for MockTransport {
    fn create_offer(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move { Ok(MOCK_OFFER.to_string()) })
    }

    fn create_answer(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            if self.remote.lock().unwrap().is_none() {
                return Err(ProtocolError::HandshakeFailed("no remote offer".to_string()));
            }
            if self.early_candidate {
                self.emit(TransportEvent::LocalCandidate(EARLY_CANDIDATE.to_string()))
                    .await;
                // Give anything listening on the event queue a chance to run.
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(MOCK_ANSWER.to_string())
        })
    }

    fn set_remote_description<'a>(
        &'a self,
        sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if sdp == BAD_DESCRIPTION {
                return Err(ProtocolError::HandshakeFailed("unparseable description".to_string()));
            }
            *self.remote.lock().unwrap() = Some(sdp.to_string());
            Ok(())
        })
    }

    fn add_ice_candidate<'a>(
        &'a self,
        candidate: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.candidates.lock().unwrap().push(candidate.to_string());
            Ok(())
        })
    }

    fn create_data_channel(
        &self,
        kind: ChannelKind,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn DataChannel>>> + Send + '_>> {
        Box::pin(async move {
            self.created.lock().unwrap().push(kind);
            Ok(MockChannel::new(kind) as Arc<dyn DataChannel>)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
    failing: AtomicBool,
    early_candidates: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Transports created from now on gather a candidate while answering.
    pub fn set_early_candidates(&self, early: bool) {
        self.early_candidates.store(early, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// The `index`-th transport created.
    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.created.lock().unwrap()[index].clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        events: mpsc::Sender<TransportEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PeerTransport>>> + Send + '_>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProtocolError::HandshakeFailed("no transport".to_string()));
            }
            let transport = Arc::new(MockTransport {
                events,
                remote: Mutex::new(None),
                candidates: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                early_candidate: self.early_candidates.load(Ordering::SeqCst),
            });
            self.created.lock().unwrap().push(transport.clone());
            Ok(transport as Arc<dyn PeerTransport>)
        })
    }
}

// --- Screen ---

#[derive(Default)]
pub struct RecordingScreen {
    output: Mutex<Vec<u8>>,
    messages: Mutex<Vec<String>>,
    clears: AtomicUsize,
    restores: AtomicUsize,
}

impl RecordingScreen {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn output(&self) -> Vec<u8> {
        self.output.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

impl Screen for RecordingScreen {
    fn write(&self, data: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(data);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn message(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }

    fn restore(&self) {
        self.restores.fetch_add(1, Ordering::SeqCst);
    }
}
