//! Message framing for the event-manager channel
//!
//! Command frame: 2-byte payload length, 1-byte command code, payload.
//! `Load` frames carry module binaries and use a 4-byte length instead.
//! Result frame: 2-byte payload length, 1-byte result code, payload.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload too large: {0} bytes")]
    TooLarge(usize),
    #[error("unknown command code: {0}")]
    UnknownCommand(u8),
    #[error("unknown result code: {0}")]
    UnknownResult(u8),
    #[error("expected {expected} bytes, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pack a u8 in network order
pub fn pack_u8(v: u8) -> [u8; 1] {
    [v]
}

/// Pack a u16 in network order
pub fn pack_u16(v: u16) -> [u8; 2] {
    v.to_be_bytes()
}

/// Pack a u32 in network order
pub fn pack_u32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

/// Unpack a network-order u8
pub fn unpack_u8(b: &[u8]) -> Result<u8, FrameError> {
    match b {
        [v] => Ok(*v),
        _ => Err(FrameError::BadLength { expected: 1, got: b.len() }),
    }
}

/// Unpack a network-order u16
pub fn unpack_u16(b: &[u8]) -> Result<u16, FrameError> {
    match b {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(FrameError::BadLength { expected: 2, got: b.len() }),
    }
}

/// Unpack a network-order u32
pub fn unpack_u32(b: &[u8]) -> Result<u32, FrameError> {
    let arr: [u8; 4] = b
        .try_into()
        .map_err(|_| FrameError::BadLength { expected: 4, got: b.len() })?;
    Ok(u32::from_be_bytes(arr))
}

/// Command codes understood by event managers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    Connect = 0,
    Call = 1,
    RemoteOutput = 2,
    RemoteRequest = 3,
    Load = 4,
    RegisterEntrypoint = 5,
}

impl CommandCode {
    /// `Load` carries binaries and is framed with a 4-byte length.
    pub fn is_load(self) -> bool {
        self == Self::Load
    }

    /// Every command is answered with a result frame except `RemoteOutput`,
    /// which is fire-and-forget.
    pub fn has_response(self) -> bool {
        self != Self::RemoteOutput
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Call),
            2 => Ok(Self::RemoteOutput),
            3 => Ok(Self::RemoteRequest),
            4 => Ok(Self::Load),
            5 => Ok(Self::RegisterEntrypoint),
            _ => Err(FrameError::UnknownCommand(value)),
        }
    }
}

/// Result codes returned by event managers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    IllegalPayload = 1,
    InternalError = 2,
    BadRequest = 3,
    CryptoError = 4,
    Generic = 5,
}

impl TryFrom<u8> for ResultCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::IllegalPayload),
            2 => Ok(Self::InternalError),
            3 => Ok(Self::BadRequest),
            4 => Ok(Self::CryptoError),
            5 => Ok(Self::Generic),
            _ => Err(FrameError::UnknownResult(value)),
        }
    }
}

/// In-band entrypoint indices, the first two bytes of a `Call` payload.
/// User-defined entrypoints start at 5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Entrypoint {
    SetKey = 0,
    Attest = 1,
    HandleInput = 2,
    HandleOutput = 3,
    HandleHandler = 4,
}

impl Entrypoint {
    pub fn to_bytes(self) -> [u8; 2] {
        pack_u16(self as u16)
    }
}

/// A framed command
#[derive(Clone, Debug)]
pub struct CommandMessage {
    pub code: CommandCode,
    pub payload: Vec<u8>,
}

impl CommandMessage {
    pub fn new(code: CommandCode, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = self.payload.len();
        let mut buf = BytesMut::with_capacity(len + 5);

        if self.code.is_load() {
            u32::try_from(len).map_err(|_| FrameError::TooLarge(len))?;
            buf.put_u32(len as u32);
        } else {
            u16::try_from(len).map_err(|_| FrameError::TooLarge(len))?;
            buf.put_u16(len as u16);
        }
        buf.put_u8(self.code as u8);
        buf.put_slice(&self.payload);

        Ok(buf.to_vec())
    }

    /// Write the encoded frame to `w`
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), FrameError> {
        w.write_all(&self.encode()?).await?;
        w.flush().await?;
        Ok(())
    }

    /// Read one command frame from `r`. The caller knows from the listening
    /// port whether this is a load channel (4-byte length) or not.
    pub async fn read_from<R: AsyncRead + Unpin>(
        r: &mut R,
        load_channel: bool,
    ) -> Result<Self, FrameError> {
        let len = if load_channel {
            let mut len = [0u8; 4];
            r.read_exact(&mut len).await?;
            u32::from_be_bytes(len) as usize
        } else {
            let mut len = [0u8; 2];
            r.read_exact(&mut len).await?;
            u16::from_be_bytes(len) as usize
        };

        let mut code = [0u8; 1];
        r.read_exact(&mut code).await?;
        let code = CommandCode::try_from(code[0])?;

        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;

        Ok(Self { code, payload })
    }
}

/// A framed result
#[derive(Clone, Debug)]
pub struct ResultMessage {
    pub code: ResultCode,
    pub payload: Vec<u8>,
}

impl ResultMessage {
    pub fn new(code: ResultCode, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    pub fn ok(&self) -> bool {
        self.code == ResultCode::Ok
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = self.payload.len();
        u16::try_from(len).map_err(|_| FrameError::TooLarge(len))?;

        let mut buf = BytesMut::with_capacity(len + 3);
        buf.put_u16(len as u16);
        buf.put_u8(self.code as u8);
        buf.put_slice(&self.payload);

        Ok(buf.to_vec())
    }

    /// Write the encoded frame to `w`
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), FrameError> {
        w.write_all(&self.encode()?).await?;
        w.flush().await?;
        Ok(())
    }

    /// Read one result frame from `r`
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, FrameError> {
        let mut len = [0u8; 2];
        r.read_exact(&mut len).await?;
        let len = u16::from_be_bytes(len) as usize;

        let mut code = [0u8; 1];
        r.read_exact(&mut code).await?;
        let code = ResultCode::try_from(code[0])?;

        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;

        Ok(Self { code, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_laws() {
        for v in [0u8, 1, 0x7f, 0xff] {
            assert_eq!(unpack_u8(&pack_u8(v)).unwrap(), v);
        }
        for v in [0u16, 1, 0x1234, u16::MAX] {
            assert_eq!(unpack_u16(&pack_u16(v)).unwrap(), v);
        }
        for v in [0u32, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(unpack_u32(&pack_u32(v)).unwrap(), v);
        }
    }

    #[test]
    fn test_pack_is_network_order() {
        assert_eq!(pack_u16(0x0102), [0x01, 0x02]);
        assert_eq!(pack_u32(0x01020304), [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_unpack_rejects_wrong_size() {
        assert!(unpack_u16(&[1, 2, 3]).is_err());
        assert!(unpack_u32(&[1, 2]).is_err());
    }

    #[test]
    fn test_command_frame_layout() {
        let msg = CommandMessage::new(CommandCode::Call, vec![0xaa, 0xbb]);
        let bytes = msg.encode().unwrap();
        // len=2 (u16), code=1, payload
        assert_eq!(bytes, vec![0x00, 0x02, 0x01, 0xaa, 0xbb]);
    }

    #[test]
    fn test_load_uses_wide_length() {
        let msg = CommandMessage::new(CommandCode::Load, vec![0xcc; 3]);
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[..5], &[0x00, 0x00, 0x00, 0x03, 0x04]);
        assert_eq!(&bytes[5..], &[0xcc; 3]);
    }

    #[test]
    fn test_result_frame_layout() {
        let msg = ResultMessage::new(ResultCode::CryptoError, vec![0x01]);
        assert_eq!(msg.encode().unwrap(), vec![0x00, 0x01, 0x04, 0x01]);
    }

    #[tokio::test]
    async fn test_command_roundtrip() {
        for (code, load) in [(CommandCode::Connect, false), (CommandCode::Load, true)] {
            let msg = CommandMessage::new(code, vec![1, 2, 3, 4]);
            let mut buf = Vec::new();
            msg.write_to(&mut buf).await.unwrap();

            let decoded = CommandMessage::read_from(&mut buf.as_slice(), load)
                .await
                .unwrap();
            assert_eq!(decoded.code, msg.code);
            assert_eq!(decoded.payload, msg.payload);
        }
    }

    #[tokio::test]
    async fn test_result_roundtrip() {
        let msg = ResultMessage::new(ResultCode::Ok, vec![0x12, 0x34]);
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();

        let decoded = ResultMessage::read_from(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded.code, ResultCode::Ok);
        assert_eq!(decoded.payload, vec![0x12, 0x34]);
    }

    #[tokio::test]
    async fn test_truncated_result_rejected() {
        let bytes = [0x00, 0x05, 0x00, 0x01]; // claims 5 payload bytes, has 1
        assert!(ResultMessage::read_from(&mut bytes.as_slice()).await.is_err());
    }

    #[test]
    fn test_unknown_codes_rejected() {
        assert!(CommandCode::try_from(6).is_err());
        assert!(ResultCode::try_from(6).is_err());
    }

    #[test]
    fn test_response_expectations() {
        assert!(!CommandCode::RemoteOutput.has_response());
        for code in [
            CommandCode::Connect,
            CommandCode::Call,
            CommandCode::RemoteRequest,
            CommandCode::Load,
            CommandCode::RegisterEntrypoint,
        ] {
            assert!(code.has_response());
        }
    }

    #[test]
    fn test_entrypoint_codes() {
        assert_eq!(Entrypoint::SetKey.to_bytes(), [0x00, 0x00]);
        assert_eq!(Entrypoint::Attest.to_bytes(), [0x00, 0x01]);
        assert_eq!(Entrypoint::HandleHandler.to_bytes(), [0x00, 0x04]);
    }
}
