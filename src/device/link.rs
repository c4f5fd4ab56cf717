//! Transport links - the I/O half of a device connection
//!
//! A [`TransportLink`] moves opaque bytes; all framing and protocol logic
//! stays in the transport codecs. One implementation per physical transport,
//! plus an in-memory mock used by the tests.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::transport::sysex;
use crate::transport::GridVariant;

/// Inbound channel depth per link. Overflow drops packets at the edge
/// rather than stalling the I/O callback.
const INBOUND_CAPACITY: usize = 256;

/// How a session reaches its hardware
#[derive(Debug, Clone)]
pub enum LinkSpec {
    /// System MIDI ports matched by name substring
    Midi {
        input_port: String,
        output_port: String,
    },
    /// Base URL of an HTTP JSON device, e.g. `http://10.0.0.5`
    Http { base_url: String },
    /// UDP destination, e.g. `10.0.0.5:21324`
    Udp { addr: String },
    /// WebSocket URL of the relay bridge
    Relay { url: String },
}

/// Byte-level connection to one device
///
/// `open` may be called again after a failure; implementations tear down any
/// half-open state first.
#[async_trait]
pub trait TransportLink: Send {
    async fn open(&mut self) -> Result<()>;

    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Out-of-band request/response probe, for transports that have one
    /// (HTTP). In-band transports fail this and handshake through
    /// `send`/inbound instead.
    async fn probe(&mut self) -> Result<Vec<u8>>;

    /// Take the inbound packet stream. `None` for send-only transports or
    /// when already taken.
    fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>>;

    async fn close(&mut self);
}

/// Build the link for a spec. Construction is cheap; all I/O happens in
/// `open`.
pub fn build_link(spec: &LinkSpec) -> Box<dyn TransportLink> {
    match spec {
        LinkSpec::Midi {
            input_port,
            output_port,
        } => Box::new(MidiLink::new(input_port, output_port)),
        LinkSpec::Http { base_url } => Box::new(HttpLink::new(base_url)),
        LinkSpec::Udp { addr } => Box::new(UdpLink::new(addr)),
        LinkSpec::Relay { url } => Box::new(RelayLink::new(url)),
    }
}

// =============================================================================
// MIDI
// =============================================================================

/// Link over a pair of system MIDI ports
pub struct MidiLink {
    input_needle: String,
    output_needle: String,
    output: Option<MidiOutputConnection>,
    // Held for its Drop; the callback feeds inbound_rx
    input: Option<MidiInputConnection<()>>,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl MidiLink {
    pub fn new(input_port: &str, output_port: &str) -> Self {
        Self {
            input_needle: input_port.to_string(),
            output_needle: output_port.to_string(),
            output: None,
            input: None,
            inbound_rx: None,
        }
    }
}

#[async_trait]
impl TransportLink for MidiLink {
    async fn open(&mut self) -> Result<()> {
        self.close().await;

        let midi_out = MidiOutput::new("gridlight-gw out").context("create MIDI output")?;
        let out_port = midi_out
            .ports()
            .into_iter()
            .find(|p| {
                midi_out
                    .port_name(p)
                    .map(|n| n.contains(&self.output_needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("no MIDI output port matching '{}'", self.output_needle))?;
        let output = midi_out
            .connect(&out_port, "gridlight-gw out")
            .map_err(|e| anyhow!("connect MIDI output: {e}"))?;

        let mut midi_in = MidiInput::new("gridlight-gw in").context("create MIDI input")?;
        // SysEx is filtered by default and carries the handshake
        midi_in.ignore(Ignore::None);
        let in_port = midi_in
            .ports()
            .into_iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.contains(&self.input_needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("no MIDI input port matching '{}'", self.input_needle))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(INBOUND_CAPACITY);
        let input = midi_in
            .connect(
                &in_port,
                "gridlight-gw in",
                move |_ts, bytes, _| {
                    // The callback runs on the MIDI driver thread; never block
                    if tx.try_send(bytes.to_vec()).is_err() {
                        warn!("Inbound MIDI queue full, packet dropped");
                    }
                },
                (),
            )
            .map_err(|e| anyhow!("connect MIDI input: {e}"))?;

        debug!(
            input = self.input_needle,
            output = self.output_needle,
            "MIDI ports connected"
        );
        self.output = Some(output);
        self.input = Some(input);
        self.inbound_rx = Some(rx);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let out = self.output.as_mut().ok_or_else(|| anyhow!("link not open"))?;
        out.send(bytes).map_err(|e| anyhow!("MIDI send: {e}"))
    }

    async fn probe(&mut self) -> Result<Vec<u8>> {
        bail!("MIDI links handshake in-band")
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx.take()
    }

    async fn close(&mut self) {
        self.input = None;
        self.output = None;
        self.inbound_rx = None;
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// Link to an HTTP JSON device. `send` posts state documents; `probe` reads
/// the info document.
pub struct HttpLink {
    base_url: String,
    client: Option<reqwest::Client>,
}

impl HttpLink {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: None,
        }
    }

    fn client(&self) -> Result<&reqwest::Client> {
        self.client.as_ref().ok_or_else(|| anyhow!("link not open"))
    }
}

#[async_trait]
impl TransportLink for HttpLink {
    async fn open(&mut self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(3))
            .build()
            .context("build HTTP client")?;
        self.client = Some(client);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let url = format!("{}/json/state", self.base_url);
        let resp = self
            .client()?
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes.to_vec())
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        resp.error_for_status()
            .map(|_| ())
            .with_context(|| format!("POST {url}"))
    }

    async fn probe(&mut self) -> Result<Vec<u8>> {
        let url = format!("{}/json/info", self.base_url);
        let resp = self
            .client()?
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        Ok(resp.bytes().await.context("read info body")?.to_vec())
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        None
    }

    async fn close(&mut self) {
        self.client = None;
    }
}

// =============================================================================
// UDP
// =============================================================================

/// Fire-and-forget UDP link
pub struct UdpLink {
    addr: String,
    socket: Option<tokio::net::UdpSocket>,
}

impl UdpLink {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            socket: None,
        }
    }
}

#[async_trait]
impl TransportLink for UdpLink {
    async fn open(&mut self) -> Result<()> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .context("bind UDP socket")?;
        socket
            .connect(&self.addr)
            .await
            .with_context(|| format!("connect UDP to {}", self.addr))?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or_else(|| anyhow!("link not open"))?;
        socket
            .send(bytes)
            .await
            .with_context(|| format!("UDP send to {}", self.addr))?;
        Ok(())
    }

    async fn probe(&mut self) -> Result<Vec<u8>> {
        bail!("UDP links have no probe")
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        None
    }

    async fn close(&mut self) {
        self.socket = None;
    }
}

// =============================================================================
// Relay WebSocket
// =============================================================================

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Link to the relay bridge over a WebSocket
pub struct RelayLink {
    url: String,
    sink: Option<WsSink>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl RelayLink {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            sink: None,
            reader_task: None,
            inbound_rx: None,
        }
    }
}

#[async_trait]
impl TransportLink for RelayLink {
    async fn open(&mut self) -> Result<()> {
        self.close().await;

        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connect relay {}", self.url))?;
        let (sink, mut stream) = ws.split();

        let (tx, rx) = mpsc::channel::<Vec<u8>>(INBOUND_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let bytes = match msg {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    // Pings are answered by the library
                    Ok(_) => continue,
                };
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
            trace!("Relay reader finished");
        });

        debug!(url = self.url, "Relay socket connected");
        self.sink = Some(sink);
        self.reader_task = Some(reader);
        self.inbound_rx = Some(rx);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let sink = self.sink.as_mut().ok_or_else(|| anyhow!("link not open"))?;
        // Envelopes are JSON text frames
        let text = String::from_utf8(bytes.to_vec()).context("relay payload must be UTF-8")?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| anyhow!("relay send: {e}"))
    }

    async fn probe(&mut self) -> Result<Vec<u8>> {
        bail!("relay links handshake in-band")
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx.take()
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.inbound_rx = None;
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Default)]
struct MockState {
    sent: Vec<Vec<u8>>,
    open_calls: u32,
    fail_opens_remaining: u32,
    fail_sends_remaining: u32,
    /// When set, a device-inquiry send is answered on the inbound channel
    /// as if hardware of this variant were attached
    auto_inquiry_reply: Option<GridVariant>,
    inbound_tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// In-memory link for tests: records outbound traffic and lets the test
/// script inbound packets and failures.
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Test-side controller for a [`MockLink`]
#[derive(Clone)]
pub struct MockLinkController {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> (Self, MockLinkController) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
                inbound_rx: None,
            },
            MockLinkController { state },
        )
    }
}

impl MockLinkController {
    /// Outbound packets recorded so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn open_calls(&self) -> u32 {
        self.state.lock().open_calls
    }

    /// Make the next `n` open attempts fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().fail_opens_remaining = n;
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().fail_sends_remaining = n;
    }

    /// Answer device inquiries as hardware of the given variant.
    pub fn impersonate(&self, variant: GridVariant) {
        self.state.lock().auto_inquiry_reply = Some(variant);
    }

    /// Inject an inbound packet, as if the hardware sent it.
    pub fn push_inbound(&self, bytes: Vec<u8>) {
        let tx = self.state.lock().inbound_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(bytes);
        }
    }
}

#[async_trait]
impl TransportLink for MockLink {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.open_calls += 1;
        if state.fail_opens_remaining > 0 {
            state.fail_opens_remaining -= 1;
            bail!("mock open failure");
        }
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        state.inbound_tx = Some(tx);
        self.inbound_rx = Some(rx);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_sends_remaining > 0 {
            state.fail_sends_remaining -= 1;
            bail!("mock send failure");
        }
        state.sent.push(bytes.to_vec());

        if let Some(variant) = state.auto_inquiry_reply {
            if bytes == sysex::encode_device_inquiry().as_slice() {
                if let Some(tx) = &state.inbound_tx {
                    let _ = tx.try_send(sysex::encode_inquiry_reply(&variant));
                }
            }
        }
        Ok(())
    }

    async fn probe(&mut self) -> Result<Vec<u8>> {
        bail!("mock links handshake in-band")
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx.take()
    }

    async fn close(&mut self) {
        self.state.lock().inbound_tx = None;
        self.inbound_rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_and_scripts() {
        let (mut link, ctl) = MockLink::new();
        ctl.fail_next_opens(1);

        assert!(link.open().await.is_err());
        assert!(link.open().await.is_ok());
        assert_eq!(ctl.open_calls(), 2);

        link.send(&[1, 2, 3]).await.unwrap();
        assert_eq!(ctl.sent(), vec![vec![1, 2, 3]]);

        let mut inbound = link.take_inbound().unwrap();
        ctl.push_inbound(vec![9]);
        assert_eq!(inbound.recv().await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_mock_impersonates_grid_hardware() {
        let (mut link, ctl) = MockLink::new();
        ctl.impersonate(GridVariant::LAUNCH_PRO);
        link.open().await.unwrap();
        let mut inbound = link.take_inbound().unwrap();

        link.send(&sysex::encode_device_inquiry()).await.unwrap();
        let reply = inbound.recv().await.unwrap();
        assert!(sysex::is_inquiry_reply(&GridVariant::LAUNCH_PRO, &reply));
    }

    #[tokio::test]
    async fn test_udp_link_open_and_send() {
        // A bound local socket makes the destination resolvable
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap().to_string();

        let mut link = UdpLink::new(&addr);
        link.open().await.unwrap();
        link.send(&[0x01, 0x02, 0xAA]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02, 0xAA]);
    }
}
