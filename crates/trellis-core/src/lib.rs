//! Trellis core library
//!
//! Cryptographic primitives shared by the deployer: the two-cipher AEAD
//! facade spoken to module event managers, and the SPONGENT sponge-wrap
//! implementation used by Sancus targets.

pub mod crypto;
pub mod spongent;

pub use crypto::{CryptoError, Encryption};
