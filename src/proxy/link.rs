//! Byte links carrying proxy packets: a TCP socket and an in-memory pair.

use crate::{Result, WearableError};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A bidirectional, ordered byte stream between proxy client and host.
pub trait ProxyLink: Send {
    /// Write all of `bytes`. A failure means the link is gone.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Non-blocking read into `buf`. `Ok(0)` when nothing is pending.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn is_connected(&self) -> bool;

    fn close(&mut self);
}

// -- TCP --

pub struct TcpLink {
    stream: TcpStream,
    peer: String,
    write_timeout: Duration,
    connected: bool,
}

impl TcpLink {
    /// Connect to `host:port`, trying each resolved address in turn.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpLink> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    log::info!("Proxy link connected to {}", addr);
                    return TcpLink::from_stream(stream, timeout);
                }
                Err(e) => {
                    log::debug!("Proxy connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no address resolved"))
            .into())
    }

    /// Wrap an accepted stream. The socket is switched to non-blocking mode.
    pub fn from_stream(stream: TcpStream, write_timeout: Duration) -> Result<TcpLink> {
        stream.set_nodelay(true).ok();
        stream.set_nonblocking(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        Ok(TcpLink {
            stream,
            peer,
            write_timeout,
            connected: true,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn fault(&mut self, e: std::io::Error) -> WearableError {
        log::warn!("Proxy link to {} failed: {}", self.peer, e);
        self.connected = false;
        e.into()
    }
}

impl ProxyLink for TcpLink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(WearableError::NotConnectedToProxy);
        }
        let deadline = Instant::now() + self.write_timeout;
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(self.fault(std::io::Error::new(ErrorKind::WriteZero, "peer closed")))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(
                            self.fault(std::io::Error::new(ErrorKind::TimedOut, "write timed out"))
                        );
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(self.fault(e)),
            }
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.connected || buf.is_empty() {
            return Ok(0);
        }
        match self.stream.read(buf) {
            Ok(0) => {
                log::info!("Proxy link to {} closed by peer", self.peer);
                self.connected = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(self.fault(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        if self.connected {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.connected = false;
        }
    }
}

// -- In-memory --

/// One end of an in-process link. Closing either end disconnects both.
pub struct MemoryLink {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    open: Arc<AtomicBool>,
}

impl MemoryLink {
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        let open = Arc::new(AtomicBool::new(true));
        (
            MemoryLink {
                tx: a_tx,
                rx: a_rx,
                pending: Vec::new(),
                open: open.clone(),
            },
            MemoryLink {
                tx: b_tx,
                rx: b_rx,
                pending: Vec::new(),
                open,
            },
        )
    }
}

impl ProxyLink for MemoryLink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(WearableError::NotConnectedToProxy);
        }
        self.tx.send(bytes.to_vec()).map_err(|_| {
            self.open.store(false, Ordering::SeqCst);
            WearableError::NotConnectedToProxy
        })
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pending.is_empty() {
                match self.rx.try_recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.open.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
            let n = self.pending.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            filled += n;
        }
        Ok(filled)
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pair_roundtrip() {
        let (mut a, mut b) = MemoryLink::pair();
        a.send(&[1, 2, 3]).unwrap();
        a.send(&[4, 5]).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(b.receive(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(b.receive(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 5);
        assert_eq!(b.receive(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_memory_close_disconnects_both() {
        let (mut a, b) = MemoryLink::pair();
        assert!(b.is_connected());
        a.close();
        assert!(!b.is_connected());
        assert!(a.send(&[0]).is_err());
    }

    #[test]
    fn test_tcp_loopback() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = TcpLink::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut server = TcpLink::from_stream(stream, Duration::from_secs(1)).unwrap();

        client.send(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = 0;
        while got < 4 && Instant::now() < deadline {
            got += server.receive(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf[..4], b"ping");

        server.close();
        assert!(!server.is_connected());
    }
}
