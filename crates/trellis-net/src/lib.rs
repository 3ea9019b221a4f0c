//! Wire protocol spoken to node event managers
//!
//! Commands and results travel as length-prefixed frames over TCP, one fresh
//! connection per logical command. All integers are big-endian.
//!
//! - [`framing`]: frame codec, command/result/entrypoint codes, pack helpers
//! - [`transport`]: per-command TCP exchange

pub mod framing;
pub mod transport;

pub use framing::{
    pack_u16, pack_u32, pack_u8, unpack_u16, unpack_u32, unpack_u8, CommandCode, CommandMessage,
    Entrypoint, FrameError, ResultCode, ResultMessage,
};
pub use transport::{send_command, WireError};
