//! The codec seam between wire frames and side-neutral envelopes.
//!
//! Each side of a session has its own codec because the caller protocol and
//! the upstream protocol differ. Decoding is pure; the session decides what a
//! failure means.

use super::transport::Frame;
use concierge_core::Envelope;

/// Longest slice of a raw payload kept in logs.
const RAW_PREVIEW_LEN: usize = 256;

pub trait WireCodec: Send + Sync {
    /// `Ok(None)` means the frame is valid but carries nothing the relay acts on.
    fn decode(&self, frame: &Frame) -> Result<Option<Envelope>, DecodeError>;

    fn encode(&self, envelope: &Envelope) -> Result<Frame, EncodeError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {reason}")]
    Malformed { raw: String, reason: String },
    #[error("unsupported {kind} frame")]
    Unsupported { raw: String, kind: &'static str },
    /// A tool call whose arguments are not valid JSON. It still has to be
    /// answered, so the identifiers survive decoding.
    #[error("malformed arguments for tool call '{call_id}' ({tool_name}): {reason}")]
    MalformedToolCall {
        call_id: String,
        tool_name: String,
        raw_arguments: String,
        reason: String,
    },
}

impl DecodeError {
    pub fn malformed(raw: &str, reason: impl ToString) -> Self {
        Self::Malformed {
            raw: raw.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The offending payload, for diagnostics.
    pub fn raw(&self) -> &str {
        match self {
            Self::Malformed { raw, .. } | Self::Unsupported { raw, .. } => raw,
            Self::MalformedToolCall { raw_arguments, .. } => raw_arguments,
        }
    }

    /// `raw()` cut down to a loggable size.
    pub fn raw_preview(&self) -> &str {
        let raw = self.raw();
        if raw.len() <= RAW_PREVIEW_LEN {
            return raw;
        }
        let mut end = RAW_PREVIEW_LEN;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        &raw[..end]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{kind} cannot be sent to the {side}")]
    Unsupported {
        kind: &'static str,
        side: &'static str,
    },
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Renders a binary payload for `DecodeError::raw`.
pub(crate) fn describe_binary(len: usize) -> String {
    format!("<{len} bytes of binary data>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_preview_truncates_on_char_boundary() {
        let raw = "é".repeat(200);
        let err = DecodeError::malformed(&raw, "bad");
        let preview = err.raw_preview();
        assert!(preview.len() <= RAW_PREVIEW_LEN);
        assert!(raw.starts_with(preview));
    }

    #[test]
    fn test_raw_of_malformed_tool_call_is_the_arguments() {
        let err = DecodeError::MalformedToolCall {
            call_id: "c1".to_string(),
            tool_name: "search_products".to_string(),
            raw_arguments: "{not json".to_string(),
            reason: "expected value".to_string(),
        };
        assert_eq!(err.raw(), "{not json");
        assert!(err.to_string().contains("c1"));
    }
}
