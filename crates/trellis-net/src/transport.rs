//! Per-command TCP exchange with an event manager
//!
//! Every logical command opens a fresh connection, writes one frame, and
//! (except for `RemoteOutput`) reads back a single result frame. A non-Ok
//! result code is an error at this layer.

use crate::framing::{CommandMessage, FrameError, ResultCode, ResultMessage};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Wire-level errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("command {code:?} failed with result code {result:?}")]
    Command { code: crate::framing::CommandCode, result: ResultCode },
}

/// Send `msg` to the event manager at `addr` and wait for its result.
///
/// Returns `None` for fire-and-forget commands. A readable but non-Ok result
/// is surfaced as [`WireError::Command`].
pub async fn send_command(
    addr: SocketAddr,
    msg: &CommandMessage,
) -> Result<Option<ResultMessage>, WireError> {
    debug!(
        "sending {:?} ({} payload bytes) to {}",
        msg.code,
        msg.payload.len(),
        addr
    );

    let mut stream = TcpStream::connect(addr).await?;
    msg.write_to(&mut stream).await?;

    if !msg.code.has_response() {
        return Ok(None);
    }

    let result = ResultMessage::read_from(&mut stream).await?;
    if !result.ok() {
        return Err(WireError::Command {
            code: msg.code,
            result: result.code,
        });
    }

    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::CommandCode;
    use tokio::net::TcpListener;

    async fn one_shot_server(result: ResultMessage) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let cmd = CommandMessage::read_from(&mut stream, false).await.unwrap();
            assert_eq!(cmd.code, CommandCode::Call);
            result.write_to(&mut stream).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_command_with_ok_response() {
        let addr = one_shot_server(ResultMessage::new(ResultCode::Ok, vec![0xab])).await;

        let msg = CommandMessage::new(CommandCode::Call, vec![0, 1, 0, 2]);
        let result = send_command(addr, &msg).await.unwrap().unwrap();
        assert_eq!(result.payload, vec![0xab]);
    }

    #[tokio::test]
    async fn test_non_ok_result_is_error() {
        let addr = one_shot_server(ResultMessage::new(ResultCode::CryptoError, vec![])).await;

        let msg = CommandMessage::new(CommandCode::Call, vec![]);
        match send_command(addr, &msg).await {
            Err(WireError::Command { result, .. }) => assert_eq!(result, ResultCode::CryptoError),
            other => panic!("expected command failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_output_has_no_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Server reads the frame and closes without answering.
            let _ = CommandMessage::read_from(&mut stream, false).await.unwrap();
        });

        let msg = CommandMessage::new(CommandCode::RemoteOutput, vec![1, 2]);
        assert!(send_command(addr, &msg).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_early_close_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let msg = CommandMessage::new(CommandCode::Call, vec![]);
        assert!(send_command(addr, &msg).await.is_err());
    }
}
