//! Wire envelope for typed queue payloads.
//!
//! A pushed job is flattened to `tag + "#|" + payload` so a consumer can
//! recover the job kind before committing to a full payload decode. The tag
//! must never contain the separator; the payload is whatever the job kind's
//! marshaller produced.

use crate::error::QueueError;

/// Separator between the type tag and the payload on the wire.
pub const SEPARATOR: &str = "#|";

/// Flattens `tag` and `payload` into a wire value.
///
/// # Errors
///
/// Returns `QueueError::Envelope` if the tag contains the separator or the
/// payload is not valid UTF-8 (the store transports textual values).
pub fn encode(tag: &str, payload: &[u8]) -> Result<String, QueueError> {
    if tag.contains(SEPARATOR) {
        return Err(QueueError::Envelope(format!(
            "tag '{tag}' contains the separator '{SEPARATOR}'"
        )));
    }
    let payload = std::str::from_utf8(payload)
        .map_err(|e| QueueError::Envelope(format!("payload is not valid UTF-8: {e}")))?;
    Ok(format!("{tag}{SEPARATOR}{payload}"))
}

/// Splits a wire value back into its type tag and payload.
///
/// # Errors
///
/// Returns `QueueError::Envelope` unless the value contains exactly one
/// separator occurrence.
pub fn decode(wire: &str) -> Result<(&str, &[u8]), QueueError> {
    let mut parts = wire.split(SEPARATOR);
    let tag = parts.next().unwrap_or_default();
    let payload = parts.next().ok_or_else(|| {
        QueueError::Envelope(format!("value does not contain the separator '{SEPARATOR}'"))
    })?;
    if parts.next().is_some() {
        return Err(QueueError::Envelope(
            "value contains more than one separator".to_string(),
        ));
    }
    Ok((tag, payload.as_bytes()))
}
