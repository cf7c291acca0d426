//! CBOR and JSON helpers for values and documents.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode any serializable item to CBOR bytes.
///
/// # Errors
///
/// Returns an error if the item cannot be represented in CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(item: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(item, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decode an item from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR for `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| map_decode_error(e.to_string()))
}

/// Encode any serializable item to a JSON string.
///
/// # Errors
///
/// Returns an error if the item cannot be represented in JSON (for example
/// a map with non-text keys).
pub fn to_json<T: Serialize + ?Sized>(item: &T) -> CodecResult<String> {
    serde_json::to_string(item).map_err(|e| CodecError::encoding_failed(e.to_string()))
}

/// Decode an item from a JSON string.
///
/// # Errors
///
/// Returns an error if the text is not valid JSON for `T`.
pub fn from_json<T: DeserializeOwned>(text: &str) -> CodecResult<T> {
    serde_json::from_str(text).map_err(|e| map_decode_error(e.to_string()))
}

fn map_decode_error(message: String) -> CodecError {
    if message.contains("float values are not supported") {
        CodecError::FloatForbidden
    } else if message.contains("integer overflow") {
        CodecError::IntegerOverflow
    } else {
        CodecError::decoding_failed(message)
    }
}
