use crate::codec::Value;
use crate::config::{SessionConfig, WireConfig};
use crate::core::frame::{FrameDecryptor, FrameEncryptor, FramePipeline, SecretMaterial};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::{decode_batch, encode_batch, Packet, Protocol};
use crate::utils::compression;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, instrument, warn};

/// Counts the session as open until both halves are dropped.
#[derive(Debug)]
struct SessionGuard;

impl SessionGuard {
    fn open() -> Arc<Self> {
        global_metrics().connection_established();
        Arc::new(SessionGuard)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        global_metrics().connection_closed();
    }
}

fn blocking_failed(e: JoinError) -> ProtocolError {
    ProtocolError::TransportError(format!("blocking (de)compression task failed: {e}"))
}

/// Outbound state: packets waiting for `flush` plus the frame encryptor.
#[derive(Debug)]
struct SendState {
    protocol: Arc<Protocol>,
    encryptor: FrameEncryptor,
    offload_threshold: usize,
    max_plaintext: usize,
    batching: bool,
    queued: Vec<Vec<u8>>,
    // Set while a sealed frame is on its way to the transport.
    in_flight: bool,
}

impl SendState {
    fn queue(&mut self, name: &str, params: &Value) -> Result<()> {
        let bytes = self.protocol.encode(name, params)?;
        if bytes.len() > self.max_plaintext {
            return Err(ProtocolError::OversizedPacket(bytes.len()));
        }
        self.queued.push(bytes);
        Ok(())
    }

    fn drain_plaintexts(&mut self) -> Result<Vec<Vec<u8>>> {
        let queued = std::mem::take(&mut self.queued);
        if self.batching && !queued.is_empty() {
            Ok(vec![encode_batch(&queued)?])
        } else {
            Ok(queued)
        }
    }

    async fn seal(&mut self, plaintext: Vec<u8>) -> Result<Bytes> {
        if self.in_flight {
            return Err(ProtocolError::SecurityError(
                constants::ERR_SEND_INTERRUPTED.into(),
            ));
        }
        let level = self.encryptor.options().level;
        let compressed = if plaintext.len() >= self.offload_threshold {
            global_metrics().offloaded();
            tokio::task::spawn_blocking(move || compression::compress(&plaintext, level))
                .await
                .map_err(blocking_failed)??
        } else {
            compression::compress(&plaintext, level)?
        };
        Ok(Bytes::from(self.encryptor.seal(compressed)?))
    }
}

/// Inbound state: the frame decryptor plus packets decoded but not yet returned.
#[derive(Debug)]
struct RecvState {
    protocol: Arc<Protocol>,
    decryptor: FrameDecryptor,
    offload_threshold: usize,
    batching: bool,
    ready: VecDeque<Result<Packet>>,
    // Set while a verified payload is being inflated off-thread.
    in_flight: bool,
}

impl RecvState {
    async fn accept(&mut self, frame: BytesMut) -> Result<()> {
        if self.in_flight {
            return Err(ProtocolError::SecurityError(
                constants::ERR_RECV_INTERRUPTED.into(),
            ));
        }
        let compressed = self.decryptor.open(frame.to_vec())?;
        let max_output = self.decryptor.options().max_output;
        let inflated = if compressed.len() >= self.offload_threshold {
            global_metrics().offloaded();
            self.in_flight = true;
            let result = tokio::task::spawn_blocking(move || {
                compression::decompress(&compressed, max_output)
            })
            .await
            .map_err(blocking_failed)?;
            self.in_flight = false;
            result
        } else {
            compression::decompress(&compressed, max_output)
        };
        let plaintext = self.decryptor.settle(inflated)?;

        if self.batching {
            for bytes in decode_batch(&plaintext)? {
                self.ready.push_back(self.protocol.decode(&bytes));
            }
        } else {
            self.ready.push_back(self.protocol.decode(&plaintext));
        }
        Ok(())
    }
}

async fn flush_into<S>(sink: &mut S, state: &mut SendState, timeout: Duration) -> Result<()>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    let plaintexts = state.drain_plaintexts()?;
    let total = plaintexts.len();
    for (index, plaintext) in plaintexts.into_iter().enumerate() {
        if let Err(e) = send_frame(sink, state, plaintext, timeout).await {
            let dropped = total - index - 1;
            if dropped > 0 {
                warn!(dropped, error = %e, "Discarding queued frames after a failed send");
            }
            return Err(e);
        }
    }
    Ok(())
}

async fn send_frame<S>(
    sink: &mut S,
    state: &mut SendState,
    plaintext: Vec<u8>,
    timeout: Duration,
) -> Result<()>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    let frame = state.seal(plaintext).await?;
    debug!(frame_len = frame.len(), timeout_ms = ?timeout.as_millis(), "Sending frame with timeout");
    state.in_flight = true;
    with_timeout_error(
        async {
            sink.send(frame).await?;
            Ok(())
        },
        timeout,
    )
    .await?;
    state.in_flight = false;
    Ok(())
}

async fn recv_from<R>(stream: &mut R, state: &mut RecvState, timeout: Duration) -> Result<Packet>
where
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    loop {
        if let Some(next) = state.ready.pop_front() {
            return next;
        }
        debug!(timeout_ms = ?timeout.as_millis(), "Receiving frame with timeout");
        let frame = with_timeout_error(
            async {
                let frame = stream.next().await.ok_or(ProtocolError::ConnectionClosed)??;
                Ok(frame)
            },
            timeout,
        )
        .await?;
        state.accept(frame).await?;
    }
}

/// Packet session over an ordered, reliable message transport.
///
/// `T` delivers one frame per item, e.g. `Framed<_, LengthDelimitedCodec>`. Each
/// direction is serialized by `&mut self`; use [`SecureConnection::into_split`] to
/// run the directions on separate tasks.
pub struct SecureConnection<T> {
    transport: T,
    tx: SendState,
    rx: RecvState,
    send_timeout: Duration,
    recv_timeout: Duration,
    last_activity: Instant,
    guard: Arc<SessionGuard>,
}

impl<T> SecureConnection<T>
where
    T: Stream<Item = io::Result<BytesMut>> + Sink<Bytes, Error = io::Error> + Unpin,
{
    /// Wrap `transport` with a fresh frame pipeline keyed by `secret`.
    pub fn new(
        transport: T,
        protocol: Arc<Protocol>,
        secret: SecretMaterial,
        config: &WireConfig,
    ) -> Result<Self> {
        let (encryptor, decryptor) = FramePipeline::new(secret, &config.frame)?.into_split();
        let session: &SessionConfig = &config.session;
        Ok(Self {
            transport,
            tx: SendState {
                protocol: protocol.clone(),
                encryptor,
                offload_threshold: session.offload_threshold_bytes,
                max_plaintext: config.frame.max_decompressed_size,
                batching: session.batching,
                queued: Vec::new(),
                in_flight: false,
            },
            rx: RecvState {
                protocol,
                decryptor,
                offload_threshold: session.offload_threshold_bytes,
                batching: session.batching,
                ready: VecDeque::new(),
                in_flight: false,
            },
            send_timeout: session.send_timeout,
            recv_timeout: session.recv_timeout,
            last_activity: Instant::now(),
            guard: SessionGuard::open(),
        })
    }

    /// Set custom timeout durations
    pub fn with_timeouts(mut self, send_timeout: Duration, recv_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self.recv_timeout = recv_timeout;
        self
    }

    /// Get the time since the last activity (send or receive)
    pub fn time_since_last_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.tx.protocol
    }

    pub fn send_counter(&self) -> u64 {
        self.tx.encryptor.counter()
    }

    pub fn recv_counter(&self) -> u64 {
        self.rx.decryptor.counter()
    }

    /// Encode one packet and send everything queued.
    #[instrument(skip(self, params), level = "debug")]
    pub async fn send(&mut self, name: &str, params: &Value) -> Result<()> {
        self.tx.queue(name, params)?;
        self.flush().await
    }

    /// Encode a packet for the next `flush`.
    pub fn queue(&mut self, name: &str, params: &Value) -> Result<()> {
        self.tx.queue(name, params)
    }

    /// Send queued packets: one frame per packet, or one batch frame when batching.
    #[instrument(skip(self), level = "debug")]
    pub async fn flush(&mut self) -> Result<()> {
        flush_into(&mut self.transport, &mut self.tx, self.send_timeout).await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Next packet from the peer.
    ///
    /// Frame-level failures are fatal; a packet that fails to decode inside a
    /// verified frame is returned as an error and the session stays usable.
    #[instrument(skip(self), level = "debug")]
    pub async fn recv(&mut self) -> Result<Packet> {
        let packet = recv_from(&mut self.transport, &mut self.rx, self.recv_timeout).await?;
        self.last_activity = Instant::now();
        Ok(packet)
    }

    /// Separate the directions so they can run on different tasks.
    pub fn into_split(self) -> (SecureSender<SplitSink<T, Bytes>>, SecureReceiver<SplitStream<T>>) {
        let (sink, stream) = self.transport.split();
        (
            SecureSender {
                sink,
                state: self.tx,
                timeout: self.send_timeout,
                _guard: self.guard.clone(),
            },
            SecureReceiver {
                stream,
                state: self.rx,
                timeout: self.recv_timeout,
                _guard: self.guard,
            },
        )
    }
}

/// Send half of a split [`SecureConnection`]
pub struct SecureSender<S> {
    sink: S,
    state: SendState,
    timeout: Duration,
    _guard: Arc<SessionGuard>,
}

impl<S> SecureSender<S>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    pub async fn send(&mut self, name: &str, params: &Value) -> Result<()> {
        self.state.queue(name, params)?;
        self.flush().await
    }

    pub fn queue(&mut self, name: &str, params: &Value) -> Result<()> {
        self.state.queue(name, params)
    }

    pub async fn flush(&mut self) -> Result<()> {
        flush_into(&mut self.sink, &mut self.state, self.timeout).await
    }

    pub fn counter(&self) -> u64 {
        self.state.encryptor.counter()
    }
}

/// Receive half of a split [`SecureConnection`]
pub struct SecureReceiver<R> {
    stream: R,
    state: RecvState,
    timeout: Duration,
    _guard: Arc<SessionGuard>,
}

impl<R> SecureReceiver<R>
where
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    pub async fn recv(&mut self) -> Result<Packet> {
        recv_from(&mut self.stream, &mut self.state, self.timeout).await
    }

    pub fn counter(&self) -> u64 {
        self.state.decryptor.counter()
    }
}
