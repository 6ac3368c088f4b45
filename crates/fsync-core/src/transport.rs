//! Encrypted packet transport and chunked file streaming.
//!
//! A [`Transport`] owns one connected stream and the [`SecureSession`]
//! negotiated on it. Every packet body is sealed before framing and opened
//! after reading; the packet header is bound in as associated data.
//!
//! Every blocking operation runs under the configured I/O deadline. A
//! timeout, like any other error here, leaves the session unusable.

use crate::fingerprint::FileFingerprint;
use crate::protocol::{
    self, CodecError, FrameError, HandshakeError, Packet, Payload, PayloadType, SecureSession,
    SessionError,
};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Largest plaintext body carried by one file chunk.
pub const MAX_CHUNK_SIZE: usize = 61440;

/// Default deadline for a single network operation.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Send failed: {0}")]
    SendFailed(#[source] FrameError),

    #[error("Receive failed: {0}")]
    ReceiveFailed(#[source] FrameError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Transfer desync: {0}")]
    Desync(String),

    #[error("File error on {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline per connect, handshake, or packet operation; `None` waits forever
    pub io_timeout: Option<Duration>,
    /// Must match on both ends, since the receiver derives the chunk count from it
    pub max_chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

impl TransportConfig {
    fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_CHUNK_SIZE {
            return Err(TransportError::InvalidConfig(format!(
                "max_chunk_size must be in 1..={MAX_CHUNK_SIZE}, got {}",
                self.max_chunk_size
            )));
        }
        Ok(())
    }
}

/// Observer for per-file transfer progress.
pub trait TransferProgress: Send {
    fn on_start(&mut self, _name: &str, _total: u64) {}
    fn on_progress(&mut self, _name: &str, _done: u64, _total: u64) {}
    fn on_finish(&mut self, _name: &str, _total: u64) {}
}

/// Progress observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl TransferProgress for NoProgress {}

/// Number of chunks needed for `size` bytes.
pub fn chunk_count(size: u64, max_chunk_size: usize) -> u64 {
    size.div_ceil(max_chunk_size as u64)
}

/// Run `fut` under an optional deadline.
pub(crate) async fn with_deadline<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::TimedOut(limit))?,
        None => fut.await,
    }
}

/// Dial `addr` under the configured deadline.
pub async fn dial(addr: &str, config: &TransportConfig) -> Result<TcpStream> {
    with_deadline(config.io_timeout, async {
        TcpStream::connect(addr)
            .await
            .map_err(TransportError::ConnectionFailed)
    })
    .await
}

/// An encrypted, framed packet channel over one stream.
pub struct Transport<S> {
    stream: S,
    session: SecureSession,
    config: TransportConfig,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handshake as the listener on an accepted stream.
    pub async fn accept(mut stream: S, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let session = with_deadline(config.io_timeout, async {
            protocol::establish_as_listener(&mut stream)
                .await
                .map_err(TransportError::from)
        })
        .await?;
        Ok(Self {
            stream,
            session,
            config,
        })
    }

    /// Handshake as the initiator on a dialed stream.
    pub async fn connect(mut stream: S, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let session = with_deadline(config.io_timeout, async {
            protocol::establish_as_initiator(&mut stream)
                .await
                .map_err(TransportError::from)
        })
        .await?;
        Ok(Self {
            stream,
            session,
            config,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn send_packet(&mut self, mut packet: Packet) -> Result<()> {
        packet.body = self.session.seal(&packet.header_bytes(), &packet.body)?;
        let bytes = packet.to_bytes()?;
        trace!(
            order_num = packet.order_num,
            payload_type = ?packet.payload_type,
            len = bytes.len(),
            "Sending packet"
        );

        let stream = &mut self.stream;
        with_deadline(self.config.io_timeout, async move {
            protocol::write_frame(stream, &bytes)
                .await
                .map_err(TransportError::SendFailed)
        })
        .await
    }

    pub async fn receive_packet(&mut self) -> Result<Packet> {
        self.receive_packet_within(self.config.io_timeout).await
    }

    /// Like [`receive_packet`](Self::receive_packet) with a one-off deadline.
    pub async fn receive_packet_within(&mut self, limit: Option<Duration>) -> Result<Packet> {
        let stream = &mut self.stream;
        let bytes = with_deadline(limit, async move {
            protocol::read_frame(stream)
                .await
                .map_err(TransportError::ReceiveFailed)
        })
        .await?;

        let mut packet = Packet::from_bytes(&bytes)?;
        packet.body = self.session.open(&packet.header_bytes(), &packet.body)?;
        trace!(
            order_num = packet.order_num,
            payload_type = ?packet.payload_type,
            "Received packet"
        );
        Ok(packet)
    }

    pub async fn send_value<T: Payload>(&mut self, value: &T) -> Result<()> {
        self.send_packet(Packet::encode(value)?).await
    }

    pub async fn receive_value<T: Payload>(&mut self) -> Result<T> {
        self.receive_value_within(self.config.io_timeout).await
    }

    pub async fn receive_value_within<T: Payload>(&mut self, limit: Option<Duration>) -> Result<T> {
        let packet = self.receive_packet_within(limit).await?;
        Ok(packet.decode()?)
    }

    pub async fn send_fingerprints(&mut self, fingerprints: &[FileFingerprint]) -> Result<()> {
        self.send_packet(Packet::serialize(fingerprints, PayloadType::FingerprintList)?)
            .await
    }

    pub async fn receive_fingerprints(&mut self) -> Result<Vec<FileFingerprint>> {
        self.receive_value().await
    }

    /// Stream a file as `size`, `count`, then `count` chunks. Returns bytes sent.
    pub async fn upload_file(
        &mut self,
        path: &Path,
        progress: &mut dyn TransferProgress,
    ) -> Result<u64> {
        let name = display_name(path);
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| file_error(path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| file_error(path, e))?
            .len();
        let max = self.config.max_chunk_size;
        let count = chunk_count(size, max);

        let wire_size = i64::try_from(size)
            .map_err(|_| TransportError::Desync(format!("{name} is too large to send")))?;
        self.send_value(&wire_size).await?;
        self.send_value(&(count as i64)).await?;
        debug!(file = %name, size, chunks = count, "Uploading file");

        progress.on_start(&name, size);
        let mut buf = vec![0u8; max];
        let mut sent = 0u64;
        for order_num in 0..count {
            let len = (size - sent).min(max as u64) as usize;
            // Fails if the file shrank after its size was announced
            file.read_exact(&mut buf[..len])
                .await
                .map_err(|e| file_error(path, e))?;
            self.send_packet(Packet::chunk(order_num as i64, buf[..len].to_vec()))
                .await?;
            sent += len as u64;
            progress.on_progress(&name, sent, size);
        }
        progress.on_finish(&name, size);

        Ok(sent)
    }

    /// Receive one file into `path`, truncating it first. Returns bytes written.
    pub async fn download_file(
        &mut self,
        path: &Path,
        progress: &mut dyn TransferProgress,
    ) -> Result<u64> {
        let name = display_name(path);
        let mut file = fs::File::create(path)
            .await
            .map_err(|e| file_error(path, e))?;

        let size: i64 = self.receive_value().await?;
        let size = u64::try_from(size)
            .map_err(|_| TransportError::Desync(format!("negative file size {size}")))?;
        let count: i64 = self.receive_value().await?;
        let max = self.config.max_chunk_size;
        let expected = chunk_count(size, max);
        if u64::try_from(count).ok() != Some(expected) {
            return Err(TransportError::Desync(format!(
                "{size} bytes should arrive in {expected} chunks, peer announced {count}"
            )));
        }
        debug!(file = %name, size, chunks = count, "Downloading file");

        progress.on_start(&name, size);
        let mut received = 0u64;
        for index in 0..expected {
            let packet = self.receive_packet().await?;
            packet.expect_type(PayloadType::FileChunk)?;
            if u64::try_from(packet.order_num).ok() != Some(index) {
                return Err(TransportError::Desync(format!(
                    "expected chunk {index}, received chunk {}",
                    packet.order_num
                )));
            }
            let offset = index * max as u64;
            if offset != received {
                return Err(TransportError::Desync(format!(
                    "chunk {index} belongs at offset {offset}, but {received} bytes were written"
                )));
            }
            let len = packet.body.len() as u64;
            if packet.body.len() > max || received + len > size {
                return Err(TransportError::Desync(format!(
                    "chunk {index} of {len} bytes overruns a {size} byte file"
                )));
            }

            file.write_all(&packet.body)
                .await
                .map_err(|e| file_error(path, e))?;
            received += len;
            progress.on_progress(&name, received, size);
        }

        if received != size {
            return Err(TransportError::Desync(format!(
                "received {received} of {size} bytes"
            )));
        }
        file.flush().await.map_err(|e| file_error(path, e))?;
        progress.on_finish(&name, size);

        Ok(received)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn file_error(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::File {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ContentHash;
    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    fn config(max_chunk_size: usize) -> TransportConfig {
        TransportConfig {
            io_timeout: Some(Duration::from_secs(5)),
            max_chunk_size,
        }
    }

    async fn connected_pair(
        config: TransportConfig,
    ) -> (Transport<DuplexStream>, Transport<DuplexStream>) {
        let (listener_side, initiator_side) = tokio::io::duplex(256 * 1024);
        let (listener, initiator) = tokio::join!(
            Transport::accept(listener_side, config.clone()),
            Transport::connect(initiator_side, config),
        );
        (listener.unwrap(), initiator.unwrap())
    }

    /// Records every callback for assertions.
    #[derive(Default)]
    struct RecordingProgress {
        started: Vec<(String, u64)>,
        updates: Vec<u64>,
        finished: usize,
    }

    impl TransferProgress for RecordingProgress {
        fn on_start(&mut self, name: &str, total: u64) {
            self.started.push((name.to_string(), total));
        }
        fn on_progress(&mut self, _name: &str, done: u64, _total: u64) {
            self.updates.push(done);
        }
        fn on_finish(&mut self, _name: &str, _total: u64) {
            self.finished += 1;
        }
    }

    // ==================== Packets ====================

    #[tokio::test]
    async fn test_packets_roundtrip_both_directions() {
        let (mut listener, mut initiator) = connected_pair(TransportConfig::default()).await;

        listener.send_value(&true).await.unwrap();
        assert!(initiator.receive_value::<bool>().await.unwrap());

        initiator.send_value(&-7i64).await.unwrap();
        assert_eq!(listener.receive_value::<i64>().await.unwrap(), -7);
    }

    #[tokio::test]
    async fn test_fingerprints_roundtrip() {
        let (mut listener, mut initiator) = connected_pair(TransportConfig::default()).await;
        let fps = vec![FileFingerprint {
            name: "x.txt".into(),
            content_hash: ContentHash::of(b"hello"),
            size: 5,
        }];

        listener.send_fingerprints(&fps).await.unwrap();
        assert_eq!(initiator.receive_fingerprints().await.unwrap(), fps);
    }

    #[tokio::test]
    async fn test_type_mismatch_surfaces() {
        let (mut listener, mut initiator) = connected_pair(TransportConfig::default()).await;

        listener.send_value(&true).await.unwrap();
        let err = initiator.receive_fingerprints().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Codec(CodecError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_body_is_encrypted_on_the_wire() {
        let (listener_side, mut raw) = tokio::io::duplex(64 * 1024);
        let (mut initiator_side, mut relay) = tokio::io::duplex(64 * 1024);

        // Handshake frames pass through; afterwards we inspect raw bytes
        let relay_task = tokio::spawn(async move {
            let frame = protocol::read_frame(&mut raw).await.unwrap();
            protocol::write_frame(&mut relay, &frame).await.unwrap();
            for _ in 0..2 {
                let frame = protocol::read_frame(&mut relay).await.unwrap();
                protocol::write_frame(&mut raw, &frame).await.unwrap();
            }
            let frame = protocol::read_frame(&mut raw).await.unwrap();
            protocol::write_frame(&mut relay, &frame).await.unwrap();

            let data = protocol::read_frame(&mut raw).await.unwrap();
            (data, relay)
        });
        let handshake = tokio::spawn(async move {
            protocol::establish_as_initiator(&mut initiator_side)
                .await
                .unwrap()
        });

        let mut listener = Transport::accept(listener_side, TransportConfig::default())
            .await
            .unwrap();
        let _session = handshake.await.unwrap();
        listener
            .send_packet(Packet::chunk(0, b"secret file contents".to_vec()))
            .await
            .unwrap();

        let (data, _relay) = relay_task.await.unwrap();
        let wire = Packet::from_bytes(&data).unwrap();
        assert_eq!(wire.payload_type, PayloadType::FileChunk);
        assert_ne!(wire.body, b"secret file contents");
    }

    // ==================== File streaming ====================

    async fn transfer(size: usize, max_chunk_size: usize) -> (Vec<u8>, Vec<u8>, RecordingProgress) {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let (mut listener, mut initiator) = connected_pair(config(max_chunk_size)).await;
        let mut quiet = NoProgress;
        let mut progress = RecordingProgress::default();
        let (sent, received) = tokio::join!(
            initiator.upload_file(&src, &mut quiet),
            listener.download_file(&dst, &mut progress),
        );
        assert_eq!(sent.unwrap(), size as u64);
        assert_eq!(received.unwrap(), size as u64);

        (content, std::fs::read(&dst).unwrap(), progress)
    }

    #[tokio::test]
    async fn test_roundtrip_various_sizes() {
        for size in [0usize, 1, 15, 16, 17, 100] {
            let (sent, received, progress) = transfer(size, 16).await;
            assert_eq!(sent, received, "size {size}");
            assert_eq!(progress.updates.len() as u64, chunk_count(size as u64, 16));
            assert_eq!(progress.finished, 1);
        }
    }

    #[tokio::test]
    async fn test_roundtrip_default_chunk_size() {
        let size = MAX_CHUNK_SIZE * 2 + 123;
        let (sent, received, progress) = transfer(size, MAX_CHUNK_SIZE).await;
        assert_eq!(sent, received);
        assert_eq!(
            progress.updates,
            vec![
                MAX_CHUNK_SIZE as u64,
                2 * MAX_CHUNK_SIZE as u64,
                size as u64
            ]
        );
        assert_eq!(progress.started, vec![("dst.bin".to_string(), size as u64)]);
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 16), 0);
        assert_eq!(chunk_count(1, 16), 1);
        assert_eq!(chunk_count(16, 16), 1);
        assert_eq!(chunk_count(17, 16), 2);
        assert_eq!(chunk_count(100, 16), 7);
    }

    #[tokio::test]
    async fn test_upload_packet_layout() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, vec![7u8; 100]).unwrap();

        let (mut listener, mut initiator) = connected_pair(config(16)).await;
        initiator.upload_file(&src, &mut NoProgress).await.unwrap();

        assert_eq!(listener.receive_value::<i64>().await.unwrap(), 100);
        assert_eq!(listener.receive_value::<i64>().await.unwrap(), 7);
        for index in 0..7 {
            let packet = listener.receive_packet().await.unwrap();
            assert_eq!(packet.payload_type, PayloadType::FileChunk);
            assert_eq!(packet.order_num, index);
            // Last chunk is 100 - 16 * 6
            let expected = if index == 6 { 4 } else { 16 };
            assert_eq!(packet.body.len(), expected);
        }
    }

    #[tokio::test]
    async fn test_download_rejects_out_of_order_chunk() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst.bin");
        let (mut listener, mut initiator) = connected_pair(config(16)).await;

        initiator.send_value(&32i64).await.unwrap();
        initiator.send_value(&2i64).await.unwrap();
        initiator
            .send_packet(Packet::chunk(1, vec![0u8; 16]))
            .await
            .unwrap();

        let err = listener
            .download_file(&dst, &mut NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Desync(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_short_middle_chunk() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst.bin");
        let (mut listener, mut initiator) = connected_pair(config(16)).await;

        initiator.send_value(&32i64).await.unwrap();
        initiator.send_value(&2i64).await.unwrap();
        initiator
            .send_packet(Packet::chunk(0, vec![0u8; 10]))
            .await
            .unwrap();
        initiator
            .send_packet(Packet::chunk(1, vec![0u8; 16]))
            .await
            .unwrap();

        let err = listener
            .download_file(&dst, &mut NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Desync(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_wrong_count() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst.bin");
        let (mut listener, mut initiator) = connected_pair(config(16)).await;

        initiator.send_value(&32i64).await.unwrap();
        initiator.send_value(&5i64).await.unwrap();

        let err = listener
            .download_file(&dst, &mut NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Desync(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_negative_size() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst.bin");
        let (mut listener, mut initiator) = connected_pair(config(16)).await;

        initiator.send_value(&-1i64).await.unwrap();

        let err = listener
            .download_file(&dst, &mut NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Desync(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_non_chunk_packet() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst.bin");
        let (mut listener, mut initiator) = connected_pair(config(16)).await;

        initiator.send_value(&4i64).await.unwrap();
        initiator.send_value(&1i64).await.unwrap();
        initiator.send_value(&true).await.unwrap();

        let err = listener
            .download_file(&dst, &mut NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Codec(CodecError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let dir = TempDir::new().unwrap();
        let (_listener, mut initiator) = connected_pair(config(16)).await;

        let err = initiator
            .upload_file(&dir.path().join("gone.txt"), &mut NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::File { .. }));
    }

    // ==================== Failure modes ====================

    #[tokio::test]
    async fn test_receive_times_out() {
        let config = TransportConfig {
            io_timeout: Some(Duration::from_millis(50)),
            ..TransportConfig::default()
        };
        let (mut listener, _initiator) = connected_pair(config).await;

        let err = listener.receive_packet().await.unwrap_err();
        assert!(matches!(err, TransportError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_handshake_times_out_against_silent_peer() {
        let config = TransportConfig {
            io_timeout: Some(Duration::from_millis(50)),
            ..TransportConfig::default()
        };
        let (_listener_side, initiator_side) = tokio::io::duplex(1024);

        let result = Transport::connect(initiator_side, config).await;
        assert!(matches!(result, Err(TransportError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_peer_hangup_is_receive_failure() {
        let (mut listener, initiator) = connected_pair(TransportConfig::default()).await;
        drop(initiator);

        let err = listener.receive_packet().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ReceiveFailed(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_chunk_size_rejected() {
        let (listener_side, _initiator_side) = tokio::io::duplex(1024);
        let result = Transport::accept(listener_side, config(0)).await;
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dial(&addr.to_string(), &TransportConfig::default()).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
