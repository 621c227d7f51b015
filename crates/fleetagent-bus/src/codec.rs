//! MessagePack framing shared by requests and replies.
//!
//! Structs are written as maps keyed by field name so either side can add
//! fields without breaking the other.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

pub fn encode<T>(value: &T) -> Result<Vec<u8>, CodecError>
where
    T: Serialize + ?Sized,
{
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    Ok(rmp_serde::from_slice(bytes)?)
}
