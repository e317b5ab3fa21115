//! Message-framed transport over TCP or TLS
//!
//! Diameter frames carry their own length in the header, so framing is a
//! buffered read loop: accumulate bytes until the header-declared length is
//! available, then hand the frame to the codec. The header length is
//! validated before any allocation so a corrupt peer cannot make us reserve
//! gigabytes.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::dict::Dictionary;
use crate::error::{DiameterError, DiameterResult};
use crate::message::{DiameterMessage, DIAMETER_HEADER_SIZE};

/// Largest frame accepted or sent
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// A peer-facing byte stream, plain or TLS
pub enum PeerStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl PeerStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            PeerStream::Tcp(s) => s.peer_addr(),
            PeerStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, PeerStream::Tls(_))
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_tls() { "Tls" } else { "Tcp" };
        f.debug_tuple(kind).field(&self.peer_addr().ok()).finish()
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PeerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One framed Diameter connection
pub struct DiameterTransport {
    stream: PeerStream,
    dict: Arc<Dictionary>,
    read_buf: BytesMut,
}

impl fmt::Debug for DiameterTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiameterTransport")
            .field("stream", &self.stream)
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

impl DiameterTransport {
    pub fn new(stream: PeerStream, dict: Arc<Dictionary>) -> Self {
        Self {
            stream,
            dict,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Connect over plain TCP
    pub async fn connect(addr: SocketAddr, dict: Arc<Dictionary>) -> DiameterResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("connected to {addr}");
        Ok(Self::new(PeerStream::Tcp(stream), dict))
    }

    /// Connect with TLS, verifying the peer as `domain`
    pub async fn connect_tls(
        addr: SocketAddr,
        domain: &str,
        config: Arc<ClientConfig>,
        dict: Arc<Dictionary>,
    ) -> DiameterResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| DiameterError::Config(format!("invalid TLS server name: {e}")))?;
        let connector = TlsConnector::from(config);
        let tls = connector.connect(server_name, stream).await?;
        debug!("connected to {addr} with TLS");
        Ok(Self::new(
            PeerStream::Tls(Box::new(TlsStream::Client(tls))),
            dict,
        ))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn dictionary(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    /// Send one message
    pub async fn send(&mut self, msg: &DiameterMessage) -> DiameterResult<()> {
        let encoded = msg.encode();
        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "outgoing message of {} bytes exceeds the {} byte limit",
                encoded.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        trace!(
            "send command {} ({} bytes)",
            msg.header.command_code,
            encoded.len()
        );
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one message, reading more bytes as needed
    pub async fn recv(&mut self) -> DiameterResult<DiameterMessage> {
        loop {
            if let Some(msg) = self.try_decode()? {
                trace!("recv command {}", msg.header.command_code);
                return Ok(msg);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(DiameterError::ConnectionClosed);
            }
        }
    }

    fn try_decode(&mut self) -> DiameterResult<Option<DiameterMessage>> {
        if self.read_buf.len() < DIAMETER_HEADER_SIZE {
            return Ok(None);
        }
        let length = u32::from_be_bytes([0, self.read_buf[1], self.read_buf[2], self.read_buf[3]])
            as usize;
        if length < DIAMETER_HEADER_SIZE || length % 4 != 0 {
            return Err(DiameterError::InvalidMessage(format!(
                "framed length {length} is not a valid message length"
            )));
        }
        if length > MAX_MESSAGE_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "framed length {length} exceeds the {MAX_MESSAGE_SIZE} byte limit"
            )));
        }
        if self.read_buf.len() < length {
            self.read_buf.reserve(length - self.read_buf.len());
            return Ok(None);
        }
        let mut frame = self.read_buf.split_to(length).freeze();
        let msg = DiameterMessage::decode(&mut frame, &self.dict)?;
        if frame.has_remaining() {
            return Err(DiameterError::InvalidMessage(
                "trailing bytes inside framed message".to_string(),
            ));
        }
        Ok(Some(msg))
    }
}

/// Listener accepting framed Diameter connections, with optional TLS
pub struct DiameterListener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    dict: Arc<Dictionary>,
}

impl DiameterListener {
    pub async fn bind(addr: SocketAddr, dict: Arc<Dictionary>) -> DiameterResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        debug!("listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            acceptor: None,
            dict,
        })
    }

    /// Terminate TLS on accepted connections
    pub fn with_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.acceptor = Some(TlsAcceptor::from(config));
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one connection, running the TLS handshake when configured
    pub async fn accept(&self) -> DiameterResult<(DiameterTransport, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let stream = match &self.acceptor {
            Some(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                PeerStream::Tls(Box::new(TlsStream::Server(tls)))
            }
            None => PeerStream::Tcp(stream),
        };
        debug!("accepted connection from {addr}");
        Ok((DiameterTransport::new(stream, self.dict.clone()), addr))
    }

    /// Accept connections forever, pushing them into the channel.
    /// Per-connection failures (TLS handshake included) are logged and do
    /// not stop the loop; the loop ends when the receiver is dropped.
    pub async fn run(self, tx: tokio::sync::mpsc::Sender<(DiameterTransport, SocketAddr)>) {
        loop {
            match self.accept().await {
                Ok(accepted) => {
                    if tx.send(accepted).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }
}
