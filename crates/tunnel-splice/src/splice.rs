//! Full-duplex byte pump between two paired streams.

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Working buffer for each forwarder direction.
const COPY_BUF_LEN: usize = 1024;

/// Pump bytes between `a` and `b` in both directions until either
/// direction ends, then return once both forwarders have.
///
/// The forwarder that observes end-of-stream or an error flushes and
/// shuts down its write side, and fires a closed signal that the
/// opposite forwarder checks before each read, so neither peer is left
/// blocked on a read against a half-open pairing. Both forwarders run
/// to completion and every half is released before this returns, at
/// which point both endpoints are closed.
///
/// End-of-stream is a normal exit and is not logged; any other read or
/// write error is logged once, as a warning naming the direction.
pub async fn splice<A, B>(a: A, b: B, a_label: &str, b_label: &str)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let closed = CancellationToken::new();
    let a_to_b = forward(a_read, b_write, a_label, b_label, closed.clone());
    let b_to_a = forward(b_read, a_write, b_label, a_label, closed.clone());

    tokio::join!(a_to_b, b_to_a);
}

/// One direction of the pump. Copies until end-of-stream, an error, or
/// the opposite direction signalling `closed`, then flushes and shuts
/// down the write side. Returns the number of bytes forwarded.
async fn forward<R, W>(
    reader: R,
    writer: W,
    from: &str,
    to: &str,
    closed: CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut buf = [0u8; COPY_BUF_LEN];
    let mut total = 0u64;

    loop {
        // The closed check never interrupts a chunk in flight: a
        // pending read has consumed nothing yet, and every completed
        // chunk is written and flushed before the next check.
        let n = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(from, to, error = %e, "forward read failed");
                    break;
                }
            },
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            warn!(from, to, error = %e, "forward write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(from, to, error = %e, "forward flush failed");
            break;
        }
        total += n as u64;
    }

    // Unblock the opposite direction, then push out anything still
    // buffered and send end-of-stream on our write side.
    closed.cancel();
    if let Err(e) = writer.shutdown().await {
        debug!(from, to, error = %e, "shutdown after forward");
    }

    debug!(from, to, bytes = total, "forward finished");
    total
}
