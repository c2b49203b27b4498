//! Bidirectional relay with idle timeout
//!
//! Two concurrent half-duplex copies. The first half to finish (EOF, error,
//! or idle timeout) raises a shared stop signal that unblocks the peer
//! half's pending read; the relay returns only once both halves are done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::common::Stream;
use crate::error::Error;

/// Buffer size for relay operations (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Shared stop signal between the two copy halves.
struct StopSignal {
    done: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn raise(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn raised(&self) {
        loop {
            let notified = self.notify.notified();
            if self.done.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Copy both directions between `client` and `remote` until either side
/// closes, errors, or sits idle for `idle_timeout`.
///
/// Returns (bytes remote→client, bytes client→remote, first error). An idle
/// timeout surfaces as `Error::Timeout`, which callers treat as a normal
/// end of flow.
pub async fn copy_bidirectional(
    client: Stream,
    remote: Stream,
    idle_timeout: Duration,
) -> (u64, u64, Result<(), Error>) {
    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let stop = StopSignal::new();

    let (inbound, outbound) = tokio::join!(
        copy_half(remote_read, client_write, idle_timeout, stop.clone()),
        copy_half(client_read, remote_write, idle_timeout, stop.clone()),
    );

    let err = inbound.1.or(outbound.1);
    (inbound.0, outbound.0, err.map_or(Ok(()), Err))
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Duration,
    stop: Arc<StopSignal>,
) -> (u64, Option<Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    let mut err = None;

    loop {
        let read = tokio::select! {
            biased;
            _ = stop.raised() => break,
            r = timeout(idle_timeout, reader.read(&mut buf)) => r,
        };

        let n = match read {
            Err(_) => {
                err = Some(Error::Timeout);
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                err = Some(Error::ReadRemote(e.to_string()));
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            err = Some(Error::WriteRemote(e.to_string()));
            break;
        }
        if let Err(e) = writer.flush().await {
            err = Some(Error::WriteRemote(e.to_string()));
            break;
        }
        total += n as u64;
    }

    stop.raise();
    let _ = writer.shutdown().await;
    (total, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_copies_both_directions() {
        let (client_a, client_b) = tokio::io::duplex(4096);
        let (remote_a, remote_b) = tokio::io::duplex(4096);

        let relay = tokio::spawn(copy_bidirectional(
            Box::new(client_b),
            Box::new(remote_a),
            Duration::from_secs(5),
        ));

        let (mut client_read, mut client_write) = tokio::io::split(client_a);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote_b);

        client_write.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        remote_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        remote_write.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        // Close both ends; the relay should finish with the right counts.
        drop(client_write);
        drop(remote_write);
        drop(client_read);
        drop(remote_read);
        let (inbound, outbound, res) = relay.await.unwrap();
        assert_eq!(inbound, 9);
        assert_eq!(outbound, 7);
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_one_side_eof_finishes_relay() {
        let (client_a, client_b) = tokio::io::duplex(4096);
        let (remote_a, _remote_b) = tokio::io::duplex(4096);

        let relay = tokio::spawn(copy_bidirectional(
            Box::new(client_b),
            Box::new(remote_a),
            Duration::from_secs(30),
        ));

        // Client hangs up immediately; the remote side never speaks. The
        // stop signal must unblock the remote->client half.
        drop(client_a);
        let started = Instant::now();
        let _ = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay did not finish after one-sided close");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_ends_relay() {
        let (_client_a, client_b) = tokio::io::duplex(4096);
        let (remote_a, _remote_b) = tokio::io::duplex(4096);

        let (inbound, outbound, res) = copy_bidirectional(
            Box::new(client_b),
            Box::new(remote_a),
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(inbound, 0);
        assert_eq!(outbound, 0);
        assert!(matches!(res, Err(Error::Timeout)));
    }
}
