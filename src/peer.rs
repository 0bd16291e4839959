//! A deliberately slow HTTP/1.1 server to pace requests against.
//!
//! One connection at a time, a handful of keep-alive requests per connection,
//! and every read and write trickles through in small chunks with a pause
//! before each, so the client has to cope with partial progress.

use std::{
    convert::Infallible,
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    thread,
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};

const BODY: &[u8] = br#"{"payload": 1337}"#;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Requests answered with `Connection: keep-alive` before the closing one.
    pub keep_alive_requests: usize,
    /// Largest read or write on the socket.
    pub chunk: usize,
    pub pause: Duration,
    /// Largest request accepted.
    pub max_request: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            keep_alive_requests: 3,
            chunk: 25,
            pause: Duration::from_secs(1),
            max_request: 65536,
        }
    }
}

pub struct Peer {
    listener: TcpListener,
    config: PeerConfig,
}

impl Peer {
    pub fn bind(addr: impl ToSocketAddrs, config: PeerConfig) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves connections one after the other.
    ///
    /// A failing connection is logged and dropped; only a failing accept ends the loop.
    pub fn run(&self) -> io::Result<Infallible> {
        loop {
            let (stream, addr) = self.listener.accept()?;
            info!(%addr, "TCP connection established");
            if let Err(error) = self.serve(stream) {
                warn!(%error, "connection dropped");
            }
        }
    }

    /// Serves one connection. Returns how many requests were answered.
    pub fn serve(&self, mut stream: TcpStream) -> io::Result<usize> {
        let total = self.config.keep_alive_requests + 1;
        let mut buf = Vec::new();
        for served in 0..total {
            let close = served + 1 == total;
            debug!(request = served + 1, close, "waiting for http request");
            if self.read_request(&mut stream, &mut buf)?.is_none() {
                info!("client closed the connection");
                return Ok(served);
            }
            self.respond(&mut stream, close)?;
        }
        Ok(total)
    }

    /// Reads one request, keeping any bytes past it in `buf` for the next one.
    /// `None` if the client hung up before sending anything.
    fn read_request(&self, stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<Option<usize>> {
        let mut chunk = vec![0; self.config.chunk.max(1)];
        loop {
            if let Some(len) = request_len(buf)? {
                if buf.len() >= len {
                    buf.drain(..len);
                    debug!(len, "recv ok");
                    return Ok(Some(len));
                }
            }

            thread::sleep(self.config.pause);
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "incomplete http request",
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > self.config.max_request {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "http request too large",
                ));
            }
        }
    }

    fn respond(&self, stream: &mut TcpStream, close: bool) -> io::Result<()> {
        thread::sleep(self.config.pause);
        let response = response(close, SystemTime::now());
        for chunk in response.chunks(self.config.chunk.max(1)) {
            thread::sleep(self.config.pause);
            stream.write_all(chunk)?;
        }
        debug!(close, "send ok");
        thread::sleep(self.config.pause);
        Ok(())
    }
}

/// Full length of the request at the head of `buf`, once its headers are complete.
fn request_len(buf: &[u8]) -> io::Result<Option<usize>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    let header_len = match request
        .parse(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let content_len = match request
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("content-length"))
    {
        None => 0,
        Some(header) => std::str::from_utf8(header.value)
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad content-length"))?,
    };
    Ok(Some(header_len + content_len))
}

fn response(close: bool, now: SystemTime) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Length: {}\r\n\
         Content-Type: application/json\r\n\
         Date: {}\r\n\
         Connection: {}\r\n\r\n",
        BODY.len(),
        httpdate::fmt_http_date(now),
        if close { "close" } else { "keep-alive" },
    )
    .into_bytes();
    response.extend_from_slice(BODY);
    response
}
