//! Byte-level encoding for the payload carried inside wire messages.
//!
//! The envelope that actually crosses the process boundary
//! ([`crate::ipc::WireInstruction`] and [`crate::ipc::WireResult`]) is
//! serialised by `ipc-channel` itself. The
//! argument and return values it carries are opaque to that layer (the
//! registry dispatches on a name, not a type), so they are encoded here into
//! plain bytes first.

use serde::Serialize;
use serde::de::DeserializeOwned;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    postcard::to_allocvec(value).map_err(|err| err.to_string())
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    postcard::from_bytes(bytes).map_err(|err| err.to_string())
}
