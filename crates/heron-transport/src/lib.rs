// TCP transport with the in-band upgrades a session can negotiate: TLS, then compression.
use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

mod compress;
pub mod tls;

pub use compress::Compression;
use compress::{Compressor, Decompressor};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("tls error")]
    Tls(#[source] rustls::Error),
    #[error("tls handshake failed")]
    TlsHandshake(#[source] std::io::Error),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("{0} bytes were buffered before the TLS upgrade")]
    BufferedBeforeTls(usize),
    #[error("transport already upgraded to {0}")]
    AlreadyUpgraded(&'static str),
}

/// Transport-level configuration defaults.
///
/// ```
/// use heron_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.read_buffer_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub read_buffer_bytes: usize,
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_buffer_bytes: 64 * 1024,
            nodelay: true,
        }
    }
}

/// Negotiated transport layers of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportMode {
    pub tls: bool,
    pub compression: Compression,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tls, self.compression) {
            (false, Compression::None) => f.write_str("plaintext"),
            (true, Compression::None) => f.write_str("tls"),
            (false, compression) => f.write_str(compression.name()),
            (true, compression) => write!(f, "tls+{}", compression.name()),
        }
    }
}

enum Io {
    Plain(TcpStream),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Io {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Io::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Io::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Io::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Io::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Io::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Io::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Io::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Io::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One byte stream to a peer, upgraded in place during the handshake.
///
/// Reads hand back plaintext (decrypted, decompressed) bytes; writes take
/// plaintext and are flushed through every active layer.
///
/// ```no_run
/// use bytes::BytesMut;
/// use heron_transport::{Transport, TransportConfig};
///
/// async fn greet() -> heron_transport::Result<()> {
///     let mut transport = Transport::connect("127.0.0.1:4150", &TransportConfig::default()).await?;
///     transport.write_all(b"  V2").await?;
///     let mut buf = BytesMut::new();
///     transport.read_buf(&mut buf).await?;
///     Ok(())
/// }
/// ```
pub struct Transport {
    io: Io,
    peer_addr: SocketAddr,
    mode: TransportMode,
    compressor: Compressor,
    decompressor: Decompressor,
    read_buffer_bytes: usize,
}

impl Transport {
    pub async fn connect(addr: &str, config: &TransportConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout {
                addr: addr.to_string(),
                timeout: config.connect_timeout,
            })??;
        Self::from_tcp(stream, config)
    }

    /// Wraps an accepted or already connected socket.
    pub fn from_tcp(stream: TcpStream, config: &TransportConfig) -> Result<Self> {
        stream.set_nodelay(config.nodelay)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            io: Io::Plain(stream),
            peer_addr,
            mode: TransportMode {
                tls: false,
                compression: Compression::None,
            },
            compressor: Compressor::new(Compression::None),
            decompressor: Decompressor::new(Compression::None),
            read_buffer_bytes: config.read_buffer_bytes,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Runs the client side of a TLS handshake over the plain socket.
    ///
    /// `buffered` is whatever the caller read but has not consumed yet; any
    /// such bytes arrived in plaintext where ciphertext was expected.
    pub async fn upgrade_tls(
        self,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        buffered: &BytesMut,
    ) -> Result<Self> {
        let (tcp, parts) = self.take_plain(buffered)?;
        let name = tls::server_name(server_name)?;
        let tls = TlsConnector::from(config)
            .connect(name, tcp)
            .await
            .map_err(Error::TlsHandshake)?;
        tracing::debug!(peer = %parts.peer_addr, "tls upgrade complete");
        Ok(parts.with_io(Io::ClientTls(Box::new(tls))))
    }

    /// Server side of the TLS upgrade, used by brokers and test peers.
    pub async fn accept_tls(self, acceptor: &TlsAcceptor, buffered: &BytesMut) -> Result<Self> {
        let (tcp, parts) = self.take_plain(buffered)?;
        let tls = acceptor.accept(tcp).await.map_err(Error::TlsHandshake)?;
        Ok(parts.with_io(Io::ServerTls(Box::new(tls))))
    }

    /// Starts compressing both directions.
    ///
    /// Bytes in `buffered` were read off the wire before the switch and are
    /// already compressed by the peer, so they are fed through the new
    /// decompressor and replaced by their plaintext.
    pub fn upgrade_compression(
        &mut self,
        compression: Compression,
        buffered: &mut BytesMut,
    ) -> Result<()> {
        if self.mode.compression != Compression::None {
            return Err(Error::AlreadyUpgraded(self.mode.compression.name()));
        }
        self.compressor = Compressor::new(compression);
        self.decompressor = Decompressor::new(compression);
        self.mode.compression = compression;
        tracing::debug!(
            peer = %self.peer_addr,
            mode = %self.mode,
            buffered = buffered.len(),
            "compression enabled"
        );
        if !buffered.is_empty() {
            let raw = buffered.split();
            self.decompressor.decompress(&raw, buffered)?;
        }
        Ok(())
    }

    /// Appends plaintext to `dst`; returns the number of bytes added, 0 on EOF.
    pub async fn read_buf(&mut self, dst: &mut BytesMut) -> Result<usize> {
        read_decoded(
            &mut self.io,
            &mut self.decompressor,
            self.read_buffer_bytes,
            dst,
        )
        .await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        write_encoded(&mut self.io, &mut self.compressor, data).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        let (read, write) = tokio::io::split(self.io);
        (
            TransportReader {
                io: read,
                decompressor: self.decompressor,
                read_buffer_bytes: self.read_buffer_bytes,
            },
            TransportWriter {
                io: write,
                compressor: self.compressor,
            },
        )
    }

    fn take_plain(self, buffered: &BytesMut) -> Result<(TcpStream, TransportParts)> {
        if !buffered.is_empty() {
            return Err(Error::BufferedBeforeTls(buffered.len()));
        }
        if self.mode.compression != Compression::None {
            return Err(Error::AlreadyUpgraded(self.mode.compression.name()));
        }
        let parts = TransportParts {
            peer_addr: self.peer_addr,
            read_buffer_bytes: self.read_buffer_bytes,
        };
        match self.io {
            Io::Plain(stream) => Ok((stream, parts)),
            Io::ClientTls(_) | Io::ServerTls(_) => Err(Error::AlreadyUpgraded("tls")),
        }
    }
}

// Everything that survives a TLS upgrade besides the socket itself.
struct TransportParts {
    peer_addr: SocketAddr,
    read_buffer_bytes: usize,
}

impl TransportParts {
    fn with_io(self, io: Io) -> Transport {
        Transport {
            io,
            peer_addr: self.peer_addr,
            mode: TransportMode {
                tls: true,
                compression: Compression::None,
            },
            compressor: Compressor::new(Compression::None),
            decompressor: Decompressor::new(Compression::None),
            read_buffer_bytes: self.read_buffer_bytes,
        }
    }
}

pub struct TransportReader {
    io: ReadHalf<Io>,
    decompressor: Decompressor,
    read_buffer_bytes: usize,
}

impl TransportReader {
    /// Appends plaintext to `dst`; returns the number of bytes added, 0 on EOF.
    pub async fn read_buf(&mut self, dst: &mut BytesMut) -> Result<usize> {
        read_decoded(
            &mut self.io,
            &mut self.decompressor,
            self.read_buffer_bytes,
            dst,
        )
        .await
    }
}

pub struct TransportWriter {
    io: WriteHalf<Io>,
    compressor: Compressor,
}

impl TransportWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        write_encoded(&mut self.io, &mut self.compressor, data).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

async fn read_decoded<R: AsyncRead + Unpin>(
    io: &mut R,
    decompressor: &mut Decompressor,
    read_buffer_bytes: usize,
    dst: &mut BytesMut,
) -> Result<usize> {
    let mut raw = BytesMut::with_capacity(read_buffer_bytes);
    loop {
        raw.clear();
        let read = io.read_buf(&mut raw).await?;
        if read == 0 {
            return Ok(0);
        }
        let before = dst.len();
        decompressor.decompress(&raw, dst)?;
        // A partial compressed chunk decodes to nothing yet; keep reading.
        if dst.len() > before {
            return Ok(dst.len() - before);
        }
    }
}

async fn write_encoded<W: AsyncWrite + Unpin>(
    io: &mut W,
    compressor: &mut Compressor,
    data: &[u8],
) -> Result<()> {
    let mut encoded = BytesMut::with_capacity(data.len());
    compressor.compress(data, &mut encoded)?;
    io.write_all(&encoded).await?;
    io.flush().await?;
    Ok(())
}
