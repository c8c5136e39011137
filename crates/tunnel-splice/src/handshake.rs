//! Two-byte rendezvous over a freshly established tunnel socket.
//!
//! The tunnel carries raw payload with no framing, so before any
//! application byte flows both peers exchange one sentinel byte each:
//! the server writes [`HELLO`], the agent answers with [`REPLY`]. A
//! stray dialer that reaches either port fails the exchange and its
//! socket is discarded by the caller. The asymmetric bytes also fix who
//! speaks first on the half-duplex exchange.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First handshake byte, sent server -> agent.
pub const HELLO: u8 = 0x01;
/// Second handshake byte, sent agent -> server.
pub const REPLY: u8 = 0x02;

/// Why a handshake attempt was abandoned.
///
/// Short reads surface as [`HandshakeError::Io`] with
/// `ErrorKind::UnexpectedEof`. The socket is left to the caller, which
/// drops it and retries with a fresh one.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected handshake byte: expected {expected:#04x}, got {got:#04x}")]
    UnexpectedByte { expected: u8, got: u8 },
}

/// Server side: offer [`HELLO`], require [`REPLY`] back.
pub async fn greet<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[HELLO]).await?;
    stream.flush().await?;

    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    if buf[0] != REPLY {
        return Err(HandshakeError::UnexpectedByte {
            expected: REPLY,
            got: buf[0],
        });
    }
    Ok(())
}

/// Agent side: require [`HELLO`], answer with [`REPLY`].
pub async fn answer<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    if buf[0] != HELLO {
        return Err(HandshakeError::UnexpectedByte {
            expected: HELLO,
            got: buf[0],
        });
    }

    stream.write_all(&[REPLY]).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use tokio::io::duplex;

    #[tokio::test]
    async fn greet_and_answer_complete() {
        let (mut server_end, mut agent_end) = duplex(8);

        let (server, agent) =
            tokio::join!(greet(&mut server_end), answer(&mut agent_end));

        server.expect("server side should complete");
        agent.expect("agent side should complete");
    }

    #[tokio::test]
    async fn greet_rejects_wrong_reply() {
        let (mut server_end, mut rogue) = duplex(8);

        let rogue_task = async {
            let mut buf = [0u8; 1];
            rogue.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], HELLO);
            rogue.write_all(&[0x00]).await.unwrap();
        };

        let (result, ()) = tokio::join!(greet(&mut server_end), rogue_task);
        match result {
            Err(HandshakeError::UnexpectedByte { expected, got }) => {
                assert_eq!(expected, REPLY);
                assert_eq!(got, 0x00);
            }
            other => panic!("expected UnexpectedByte, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn answer_rejects_wrong_hello() {
        let (mut agent_end, mut rogue) = duplex(8);

        rogue.write_all(&[0x7f]).await.unwrap();

        match answer(&mut agent_end).await {
            Err(HandshakeError::UnexpectedByte { expected, got }) => {
                assert_eq!(expected, HELLO);
                assert_eq!(got, 0x7f);
            }
            other => panic!("expected UnexpectedByte, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn greet_fails_on_peer_close() {
        let (mut server_end, rogue) = duplex(8);

        // Peer disappears without answering.
        drop(rogue);

        match greet(&mut server_end).await {
            Err(HandshakeError::Io(e)) => {
                assert_eq!(e.kind(), ErrorKind::UnexpectedEof);
            }
            other => panic!("expected Io(UnexpectedEof), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn answer_fails_on_peer_close() {
        let (mut agent_end, rogue) = duplex(8);

        drop(rogue);

        match answer(&mut agent_end).await {
            Err(HandshakeError::Io(e)) => {
                assert_eq!(e.kind(), ErrorKind::UnexpectedEof);
            }
            other => panic!("expected Io(UnexpectedEof), got {:?}", other),
        }
    }
}
