//! TCP transport sink
//!
//! Every accepted connection is a viewer. Each message is a fixed 48-byte
//! big-endian header followed by the payload:
//!
//! ```text
//! 0   magic "ACST"
//! 4   version (1)
//! 5   kind (0 raw BGRA, 1 H.264, 2 HEVC, 255 metadata reset)
//! 6   flags (bit 0: key frame)
//! 7   reserved
//! 8   width, height, stride (u32 each)
//! 20  frame rate numerator, denominator (u32 each)
//! 28  timestamp in 100 ns units (u64)
//! 36  sequence (u64)
//! 44  payload length (u32)
//! ```
//!
//! Writes happen on a task per viewer behind a bounded queue, so a slow
//! viewer loses frames instead of stalling the lane.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock as ParkingRwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CompressedTransportFrame, RawTransportFrame, TransportSink};
use crate::config::CodecMode;
use crate::error::{Result, StreamError};
use crate::utils::LogThrottler;
use crate::video::format::FrameRate;
use crate::warn_throttled;

pub const HEADER_LEN: usize = 48;
pub const MAGIC: [u8; 4] = *b"ACST";
pub const PROTOCOL_VERSION: u8 = 1;

/// Messages a viewer may have queued before frames are dropped
pub const DEFAULT_VIEWER_QUEUE: usize = 8;

const FLAG_KEY_FRAME: u8 = 0x01;

/// Payload type carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    RawBgra,
    H264,
    Hevc,
    /// Stream parameters changed; discard decoder state
    Reset,
}

impl MessageKind {
    fn to_byte(self) -> u8 {
        match self {
            MessageKind::RawBgra => 0,
            MessageKind::H264 => 1,
            MessageKind::Hevc => 2,
            MessageKind::Reset => 255,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageKind::RawBgra),
            1 => Some(MessageKind::H264),
            2 => Some(MessageKind::Hevc),
            255 => Some(MessageKind::Reset),
            _ => None,
        }
    }

    fn for_codec(codec: CodecMode) -> Self {
        match codec {
            CodecMode::Raw => MessageKind::RawBgra,
            CodecMode::H264 => MessageKind::H264,
            CodecMode::Hevc => MessageKind::Hevc,
        }
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub key_frame: bool,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub frame_rate: FrameRate,
    pub timestamp: u64,
    pub sequence: u64,
    pub payload_len: u32,
}

impl MessageHeader {
    fn reset() -> Self {
        Self {
            kind: MessageKind::Reset,
            key_frame: false,
            width: 0,
            height: 0,
            stride: 0,
            frame_rate: FrameRate {
                numerator: 0,
                denominator: 1,
            },
            timestamp: 0,
            sequence: 0,
            payload_len: 0,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind.to_byte());
        buf.put_u8(if self.key_frame { FLAG_KEY_FRAME } else { 0 });
        buf.put_u8(0);
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(self.stride);
        buf.put_u32(self.frame_rate.numerator);
        buf.put_u32(self.frame_rate.denominator);
        buf.put_u64(self.timestamp);
        buf.put_u64(self.sequence);
        buf.put_u32(self.payload_len);
    }

    /// Parse a header; `None` on bad magic, version or kind
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Option<Self> {
        if buf[0..4] != MAGIC || buf[4] != PROTOCOL_VERSION {
            return None;
        }
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u64_at = |i: usize| (u32_at(i) as u64) << 32 | u32_at(i + 4) as u64;
        Some(Self {
            kind: MessageKind::from_byte(buf[5])?,
            key_frame: buf[6] & FLAG_KEY_FRAME != 0,
            width: u32_at(8),
            height: u32_at(12),
            stride: u32_at(16),
            frame_rate: FrameRate {
                numerator: u32_at(20),
                denominator: u32_at(24),
            },
            timestamp: u64_at(28),
            sequence: u64_at(36),
            payload_len: u32_at(44),
        })
    }
}

fn encode_message(header: &MessageHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.write_to(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

struct Viewer {
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    /// Compressed frames are withheld until the next key frame
    needs_key_frame: bool,
    dropped: u64,
}

struct Shared {
    viewers: ParkingRwLock<HashMap<u64, Viewer>>,
    /// Cached viewer count served to the activation monitor
    live: AtomicUsize,
}

impl Shared {
    fn register(&self, id: u64, viewer: Viewer) {
        let peer = viewer.peer;
        let mut viewers = self.viewers.write();
        viewers.insert(id, viewer);
        self.live.store(viewers.len(), Ordering::SeqCst);
        info!("Viewer {} connected from {} (total: {})", id, peer, viewers.len());
    }

    fn unregister(&self, id: u64) {
        let mut viewers = self.viewers.write();
        if let Some(viewer) = viewers.remove(&id) {
            self.live.store(viewers.len(), Ordering::SeqCst);
            info!(
                "Viewer {} ({}) disconnected, {} frames dropped (total: {})",
                id,
                viewer.peer,
                viewer.dropped,
                viewers.len()
            );
        }
    }

    /// Queue `message` for every viewer; full queues drop it
    fn broadcast(&self, message: &Bytes, key_frame: Option<bool>, throttler: &LogThrottler) {
        let mut viewers = self.viewers.write();
        for (id, viewer) in viewers.iter_mut() {
            if let Some(key) = key_frame {
                if viewer.needs_key_frame && !key {
                    continue;
                }
            }
            match viewer.tx.try_send(message.clone()) {
                Ok(()) => {
                    if key_frame.is_some() {
                        viewer.needs_key_frame = false;
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    viewer.dropped += 1;
                    if key_frame.is_some() {
                        viewer.needs_key_frame = true;
                    }
                    warn_throttled!(throttler, "viewer_queue_full", "Viewer {} too slow, dropping frames", id);
                }
                // Writer task is exiting and will unregister
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn require_key_frames(&self) {
        for viewer in self.viewers.write().values_mut() {
            viewer.needs_key_frame = true;
        }
    }
}

/// Streams frames to TCP viewers
pub struct TcpTransportSink {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    throttler: LogThrottler,
}

impl TcpTransportSink {
    /// Bind `addr` and start accepting viewers
    pub async fn bind(addr: SocketAddr, viewer_queue: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamError::TransportUnavailable(format!("cannot listen on {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            viewers: ParkingRwLock::new(HashMap::new()),
            live: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            viewer_queue.max(1),
            cancel.clone(),
        ));

        info!("TCP sink listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shared,
            cancel,
            accept_task: parking_lot::Mutex::new(Some(task)),
            throttler: LogThrottler::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and disconnect every viewer
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("TCP sink on {} closed", self.local_addr);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::TransportUnavailable(format!(
                "sink on {} is closed",
                self.local_addr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportSink for TcpTransportSink {
    fn connection_count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.shared.live.load(Ordering::SeqCst))
    }

    async fn send_raw(&self, frame: RawTransportFrame<'_>) -> Result<()> {
        self.ensure_open()?;
        let payload_len = u32::try_from(frame.data.len())
            .map_err(|_| StreamError::Transport(format!("frame too large: {} bytes", frame.data.len())))?;
        let header = MessageHeader {
            kind: MessageKind::RawBgra,
            key_frame: true,
            width: frame.width,
            height: frame.height,
            stride: frame.stride,
            frame_rate: frame.frame_rate,
            timestamp: frame.timestamp,
            sequence: frame.sequence,
            payload_len,
        };
        let message = encode_message(&header, frame.data);
        self.shared.broadcast(&message, None, &self.throttler);
        Ok(())
    }

    async fn send_compressed(&self, frame: CompressedTransportFrame) -> Result<()> {
        self.ensure_open()?;
        let payload_len = u32::try_from(frame.data.len())
            .map_err(|_| StreamError::Transport(format!("access unit too large: {} bytes", frame.data.len())))?;
        let header = MessageHeader {
            kind: MessageKind::for_codec(frame.codec),
            key_frame: frame.key_frame,
            width: frame.resolution.width,
            height: frame.resolution.height,
            stride: 0,
            frame_rate: frame.frame_rate,
            timestamp: frame.timestamp,
            sequence: frame.sequence,
            payload_len,
        };
        let message = encode_message(&header, &frame.data);
        self.shared.broadcast(&message, Some(frame.key_frame), &self.throttler);
        Ok(())
    }

    async fn clear_metadata(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.require_key_frames();
        let message = encode_message(&MessageHeader::reset(), &[]);
        self.shared.broadcast(&message, None, &self.throttler);
        debug!("Sent metadata reset to {} viewer(s)", self.shared.live.load(Ordering::SeqCst));
        Ok(())
    }
}

impl Drop for TcpTransportSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, viewer_queue: usize, cancel: CancellationToken) {
    let next_id = AtomicU64::new(1);
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel(viewer_queue);
                shared.register(
                    id,
                    Viewer {
                        peer,
                        tx,
                        needs_key_frame: true,
                        dropped: 0,
                    },
                );
                tokio::spawn(viewer_task(id, stream, rx, shared.clone(), cancel.clone()));
            }
            Err(e) => {
                warn!("Failed to accept viewer: {}", e);
            }
        }
    }

    // Dropping the senders ends every writer task
    let ids: Vec<u64> = shared.viewers.read().keys().copied().collect();
    for id in ids {
        shared.unregister(id);
    }
}

async fn viewer_task(
    id: u64,
    stream: TcpStream,
    mut rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = writer.write_all(&message).await {
                    debug!("Viewer {} write failed: {}", id, e);
                    break;
                }
            }
            // Viewers never send; a read completing means EOF or an error
            read = reader.read(&mut scratch) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    shared.unregister(id);
}
