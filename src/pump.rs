//! Bidirectional byte pumps between two connections
//!
//! Used for hijacked protocol upgrades and raw TCP relaying. Each pump runs
//! two copy loops; when either one ends, the other is told to stop and both
//! connections are closed once both loops have exited.

use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error};

const BUFFER_SIZE: usize = 16 * 1024;

struct Inner {
    pumps: DashMap<u64, Arc<watch::Sender<bool>>>,
    next_id: AtomicU64,
}

/// Registry of running pumps
#[derive(Clone)]
pub struct PumpRegistry {
    inner: Arc<Inner>,
}

impl Default for PumpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PumpRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pumps: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of running pumps
    pub fn len(&self) -> usize {
        self.inner.pumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pumps.is_empty()
    }

    /// Start pumping bytes between `a` and `b`, returning the pump id
    pub fn start<A, B>(&self, a: A, b: B) -> u64
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        self.inner.pumps.insert(id, stop_tx.clone());

        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        tokio::spawn(relay(
            id,
            "downstream",
            a_read,
            b_write,
            stop_rx.clone(),
            stop_tx.clone(),
            self.clone(),
        ));
        tokio::spawn(relay(id, "upstream", b_read, a_write, stop_rx, stop_tx, self.clone()));

        debug!(pump_id = id, active = self.len(), "Pump started");
        id
    }

    /// Signal every running pump to stop
    pub fn stop_all(&self) {
        for entry in self.inner.pumps.iter() {
            entry.value().send_replace(true);
        }
    }

    fn deregister(&self, id: u64) {
        self.inner.pumps.remove(&id);
    }
}

/// Copy from `reader` to `writer` until EOF, an error, or a stop signal
async fn relay<R, W>(
    id: u64,
    direction: &'static str,
    mut reader: R,
    mut writer: W,
    mut stop: watch::Receiver<bool>,
    stop_peer: Arc<watch::Sender<bool>>,
    registry: PumpRegistry,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total: u64 = 0;

    let result: io::Result<()> = loop {
        let step = async {
            let n = reader.read(&mut buf).await?;
            if n > 0 {
                writer.write_all(&buf[..n]).await?;
            }
            Ok::<usize, io::Error>(n)
        };

        tokio::select! {
            r = step => match r {
                Ok(0) => break Ok(()),
                Ok(n) => total += n as u64,
                Err(e) => break Err(e),
            },
            _ = stop.wait_for(|stopped| *stopped) => break Ok(()),
        }
    };

    let _ = writer.shutdown().await;
    stop_peer.send_replace(true);
    registry.deregister(id);

    match result {
        Ok(()) => debug!(pump_id = id, direction, bytes = total, "Pump direction finished"),
        Err(e) if is_silent_io_error(&e) => {
            debug!(pump_id = id, direction, bytes = total, error = %e, "Pump connection closed")
        }
        Err(e) => error!(pump_id = id, direction, bytes = total, error = %e, "Pump I/O error"),
    }
}

/// Errors that only mean the peer went away
pub fn is_silent_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    async fn wait_until_empty(registry: &PumpRegistry) {
        for _ in 0..100 {
            if registry.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pumps still running: {}", registry.len());
    }

    #[test]
    fn test_silent_errors() {
        assert!(is_silent_io_error(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_silent_io_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_silent_io_error(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_silent_io_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_pump_copies_both_directions() {
        let registry = PumpRegistry::new();
        let (mut client, proxy_a) = duplex(64 * 1024);
        let (proxy_b, mut upstream) = duplex(64 * 1024);
        registry.start(proxy_a, proxy_b);
        assert_eq!(registry.len(), 1);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        wait_until_empty(&registry).await;

        // The upstream side sees EOF once the pump closes it
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_pump_copies_large_payload() {
        let registry = PumpRegistry::new();
        let (mut client, proxy_a) = duplex(8 * 1024);
        let (proxy_b, mut upstream) = duplex(8 * 1024);
        registry.start(proxy_a, proxy_b);

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let registry = PumpRegistry::new();
        let (_client, proxy_a) = duplex(1024);
        let (proxy_b, mut upstream) = duplex(1024);
        registry.start(proxy_a, proxy_b);

        registry.stop_all();
        wait_until_empty(&registry).await;

        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
