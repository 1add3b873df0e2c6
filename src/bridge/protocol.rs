//! Terminal WebSocket wire conventions
//!
//! - binary frames carry shell bytes in both directions
//! - the first client frame is a `{"cols": N, "rows": M}` JSON document
//! - later text frames with the same shape (optionally tagged
//!   `"type": "resize"`) resize the PTY; any other text is shell input
//! - the server ends every session with a close frame

use std::borrow::Cow;

use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use super::error::GeometryError;
use crate::ssh::TerminalGeometry;

/// RFC 6455 caps the close payload at 125 bytes, 2 of which are the code
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Reject absurd sizes instead of forwarding them to the PTY
const MAX_DIMENSION: u32 = 10_000;

#[derive(Debug, Deserialize)]
struct GeometryFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    cols: Option<u32>,
    rows: Option<u32>,
}

/// Parse the mandatory first frame. Missing fields default to 80x24.
pub fn parse_initial_geometry(payload: &[u8]) -> Result<TerminalGeometry, GeometryError> {
    let frame: GeometryFrame = serde_json::from_slice(payload)
        .map_err(|e| GeometryError::Malformed(e.to_string()))?;

    let defaults = TerminalGeometry::default();
    let geometry = TerminalGeometry::new(
        frame.cols.unwrap_or(defaults.cols),
        frame.rows.unwrap_or(defaults.rows),
    );
    if geometry.cols > MAX_DIMENSION || geometry.rows > MAX_DIMENSION {
        return Err(GeometryError::Malformed(format!(
            "{}x{} exceeds {}",
            geometry.cols, geometry.rows, MAX_DIMENSION
        )));
    }
    Ok(geometry.normalized())
}

/// Recognize a mid-session resize request.
///
/// Both dimensions must be present and non-zero; anything else is treated
/// as ordinary input by the caller.
pub fn parse_resize(text: &str) -> Option<TerminalGeometry> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let frame: GeometryFrame = serde_json::from_str(trimmed).ok()?;
    if frame.kind.as_deref().is_some_and(|kind| kind != "resize") {
        return None;
    }
    match (frame.cols, frame.rows) {
        (Some(cols), Some(rows))
            if (1..=MAX_DIMENSION).contains(&cols) && (1..=MAX_DIMENSION).contains(&rows) =>
        {
            Some(TerminalGeometry::new(cols, rows))
        }
        _ => None,
    }
}

/// Longest prefix of `reason` that fits a close frame, cut on a char boundary
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

pub fn close_frame(code: CloseCode, reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: Cow::Owned(truncate_reason(reason).to_string()),
    }
}
