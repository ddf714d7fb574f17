//! Byte stream carriers and the wire formatter.
//!
//! `ClientStream` abstracts the client-facing transport (plain TCP or a
//! server-side TLS session over TCP). `Formatter` layers exact-sized reads
//! and writes on top of any async stream and keeps the single-byte push-back
//! buffer used to peek message types before dispatching.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::error::{Error, Result};

/// Client-facing transport. Starts out plain and may be upgraded to TLS
/// during VeNCrypt negotiation.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientStream {
    /// Take back the raw TCP stream for a TLS upgrade. Fails on a stream
    /// that is already TLS.
    pub fn into_plain(self) -> Result<TcpStream> {
        match self {
            ClientStream::Plain(tcp) => Ok(tcp),
            ClientStream::Tls(_) => Err(Error::protocol(
                "cannot take the raw socket from a TLS stream",
            )),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Exact-sized reads and writes over an async stream, in network byte order,
/// with a single-byte push-back buffer.
pub struct Formatter<S> {
    stream: S,
    pushback: Option<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Formatter<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pushback: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Return the next byte without consuming it. Cancel-safe: a single byte
    /// is either fully read into the push-back buffer or not read at all.
    pub async fn peek(&mut self) -> Result<u8> {
        if self.pushback.is_none() {
            let byte = self.stream.read_u8().await.map_err(Error::from_io)?;
            self.pushback = Some(byte);
        }
        Ok(self.pushback.unwrap())
    }

    /// Push one byte back so that the next read retrieves it first. The
    /// buffer holds exactly one byte; pushing into an occupied buffer is a
    /// hard error.
    pub fn push_back(&mut self, byte: u8) -> Result<()> {
        if self.pushback.is_some() {
            return Err(Error::protocol("push-back buffer overflow"));
        }
        self.pushback = Some(byte);
        Ok(())
    }

    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut start = 0;
        if let Some(byte) = self.pushback.take() {
            if buf.is_empty() {
                self.pushback = Some(byte);
                return Ok(());
            }
            buf[0] = byte;
            start = 1;
        }
        self.stream
            .read_exact(&mut buf[start..])
            .await
            .map_err(Error::from_io)?;
        Ok(())
    }

    pub async fn recv_u8(&mut self) -> Result<u8> {
        if let Some(byte) = self.pushback.take() {
            return Ok(byte);
        }
        self.stream.read_u8().await.map_err(Error::from_io)
    }

    pub async fn recv_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.recv_exact(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    pub async fn recv_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.recv_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    pub async fn recv_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.recv_exact(&mut buf).await?;
        Ok(i32::from_be_bytes(buf))
    }

    pub async fn recv_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.recv_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Receive `len` bytes as a string, replacing invalid UTF-8.
    pub async fn recv_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.recv_bytes(len).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn send_raw(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send_u8(&mut self, value: u8) -> Result<()> {
        self.send_raw(&[value]).await
    }

    pub async fn send_u16(&mut self, value: u16) -> Result<()> {
        self.send_raw(&value.to_be_bytes()).await
    }

    pub async fn send_u32(&mut self, value: u32) -> Result<()> {
        self.send_raw(&value.to_be_bytes()).await
    }

    pub async fn send_i32(&mut self, value: i32) -> Result<()> {
        self.send_raw(&value.to_be_bytes()).await
    }

    /// Pump `len` bytes to `dst` through a scratch buffer without exposing
    /// them to the caller.
    pub async fn forward_directly<D>(&mut self, dst: &mut Formatter<D>, mut len: usize) -> Result<()>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let mut scratch = [0u8; 8192];
        while len > 0 {
            let chunk = len.min(scratch.len());
            self.recv_exact(&mut scratch[..chunk]).await?;
            dst.send_raw(&scratch[..chunk]).await?;
            len -= chunk;
        }
        Ok(())
    }

    /// Forward one byte and return its value.
    pub async fn forward_u8<D>(&mut self, dst: &mut Formatter<D>) -> Result<u8>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let byte = self.recv_u8().await?;
        dst.send_u8(byte).await?;
        Ok(byte)
    }

    /// Forward four bytes and return them as a u32.
    pub async fn forward_u32<D>(&mut self, dst: &mut Formatter<D>) -> Result<u32>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let value = self.recv_u32().await?;
        dst.send_u32(value).await?;
        Ok(value)
    }
}
