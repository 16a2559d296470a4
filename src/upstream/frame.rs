// =============================================================================
// Frame Decoder — classify inbound WebSocket frames into a discriminated result
// =============================================================================
//
// Nothing throws across this boundary: every frame becomes a DecodedFrame and
// malformed input is audited and dropped by the caller. The upstream's native
// format is raw-deflate-compressed JSON; zlib-wrapped payloads show up
// occasionally and gzip is probed for completeness.
// =============================================================================

use std::io::Read as _;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use tracing::{debug, trace};

use crate::audit::{AuditRecord, AuditSink};

/// Binary frames at or under this size are connection heartbeats, not
/// payloads, and are never decoded.
const HEARTBEAT_MAX_LEN: usize = 16;

/// Upper bound on decompressed payload size. Anything larger is hostile or
/// corrupt; the decoder truncates and the parse fails closed.
const MAX_INFLATED_LEN: u64 = 8 * 1024 * 1024;

/// Hex-signature prefix length for unknown binary frames.
const SIGNATURE_BYTES: usize = 32;

/// Classification result for one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// Text "ok" — keep-alive, discarded silently.
    KeepAlive,
    /// Tiny binary frame; not decoded.
    Heartbeat,
    Json(serde_json::Value),
    Xml(String),
    /// Unclassifiable frame; `signature` is a hex dump of the first bytes.
    Unknown { signature: String },
}

pub struct FrameDecoder {
    audit: AuditSink,
}

impl FrameDecoder {
    pub fn new(audit: AuditSink) -> Self {
        Self { audit }
    }

    // -------------------------------------------------------------------------
    // Text frames
    // -------------------------------------------------------------------------

    pub fn decode_text(&self, text: &str) -> DecodedFrame {
        let trimmed = text.trim();

        if trimmed == "ok" {
            trace!("keep-alive frame");
            return DecodedFrame::KeepAlive;
        }

        if trimmed.starts_with('<') {
            self.note("xml", trimmed.len());
            return DecodedFrame::Xml(trimmed.to_string());
        }

        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return match serde_json::from_str(trimmed) {
                Ok(value) => {
                    self.note("json", trimmed.len());
                    DecodedFrame::Json(value)
                }
                Err(e) => {
                    self.audit.submit(
                        AuditRecord::new("DECODE_FAILED", "frame")
                            .field_str("kind", "text-json")
                            .field_str("error", e.to_string()),
                    );
                    DecodedFrame::Unknown {
                        signature: hex_signature(trimmed.as_bytes()),
                    }
                }
            };
        }

        self.audit.submit(
            AuditRecord::new("DECODE_FAILED", "frame")
                .field_str("kind", "text")
                .field_str("signature", hex_signature(trimmed.as_bytes())),
        );
        DecodedFrame::Unknown {
            signature: hex_signature(trimmed.as_bytes()),
        }
    }

    // -------------------------------------------------------------------------
    // Binary frames
    // -------------------------------------------------------------------------

    pub fn decode_binary(&self, data: &[u8]) -> DecodedFrame {
        if data.len() <= HEARTBEAT_MAX_LEN {
            trace!(len = data.len(), "binary heartbeat frame");
            return DecodedFrame::Heartbeat;
        }

        match inflate(data) {
            Some((codec, inflated)) => {
                let text = String::from_utf8_lossy(&inflated);
                let trimmed = text.trim();

                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    match serde_json::from_str(trimmed) {
                        Ok(value) => {
                            let tag = if codec == "deflate" {
                                "deflate-json".to_string()
                            } else {
                                codec.to_string()
                            };
                            self.note(&tag, data.len());
                            return DecodedFrame::Json(value);
                        }
                        Err(e) => {
                            self.audit.submit(
                                AuditRecord::new("DECODE_FAILED", "frame")
                                    .field_str("kind", codec)
                                    .field_str("error", e.to_string()),
                            );
                            return DecodedFrame::Unknown {
                                signature: hex_signature(data),
                            };
                        }
                    }
                }

                if trimmed.starts_with('<') {
                    self.note(&format!("{codec}-xml"), data.len());
                    return DecodedFrame::Xml(trimmed.to_string());
                }

                self.unknown_binary(data)
            }
            None => self.unknown_binary(data),
        }
    }

    fn unknown_binary(&self, data: &[u8]) -> DecodedFrame {
        let signature = hex_signature(data);
        self.audit.submit(
            AuditRecord::new("DECODE_FAILED", "frame")
                .field_str("kind", "unknown")
                .field_str("signature", signature.clone())
                .field("len", serde_json::json!(data.len())),
        );
        DecodedFrame::Unknown { signature }
    }

    fn note(&self, kind: &str, len: usize) {
        debug!(kind, len, "frame classified");
        self.audit.submit(
            AuditRecord::new("FRAME_CLASSIFIED", "frame")
                .field_str("kind", kind)
                .field("len", serde_json::json!(len)),
        );
    }
}

// =============================================================================
// Decompression probes
// =============================================================================

/// Magic-byte dispatch with fallback: gzip (1f 8b), zlib (78 01|9c|da), else
/// raw deflate first and the other two as fallback attempts.
fn inflate(data: &[u8]) -> Option<(&'static str, Vec<u8>)> {
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        if let Some(out) = try_gzip(data) {
            return Some(("gzip", out));
        }
    }
    if data.len() >= 2 && data[0] == 0x78 && matches!(data[1], 0x01 | 0x9c | 0xda) {
        if let Some(out) = try_zlib(data) {
            return Some(("zlib", out));
        }
    }
    if let Some(out) = try_deflate(data) {
        return Some(("deflate", out));
    }
    if let Some(out) = try_zlib(data) {
        return Some(("zlib", out));
    }
    if let Some(out) = try_gzip(data) {
        return Some(("gzip", out));
    }
    None
}

fn try_deflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = DeflateDecoder::new(data).take(MAX_INFLATED_LEN);
    decoder.read_to_end(&mut out).ok()?;
    (!out.is_empty()).then_some(out)
}

fn try_zlib(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(data).take(MAX_INFLATED_LEN);
    decoder.read_to_end(&mut out).ok()?;
    (!out.is_empty()).then_some(out)
}

fn try_gzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = GzDecoder::new(data).take(MAX_INFLATED_LEN);
    decoder.read_to_end(&mut out).ok()?;
    (!out.is_empty()).then_some(out)
}

fn hex_signature(data: &[u8]) -> String {
    hex::encode(&data[..data.len().min(SIGNATURE_BYTES)])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write as _;
    use std::sync::Arc;

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(crate::audit::AuditSink::disabled(Arc::new(
            ManualClock::at(0),
        )))
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn ok_text_is_keepalive() {
        assert_eq!(decoder().decode_text("ok"), DecodedFrame::KeepAlive);
        assert_eq!(decoder().decode_text(" ok "), DecodedFrame::KeepAlive);
    }

    #[test]
    fn angle_bracket_text_is_xml() {
        match decoder().decode_text(r#"<tick gameId="G1"/>"#) {
            DecodedFrame::Xml(s) => assert!(s.starts_with("<tick")),
            other => panic!("expected xml, got {other:?}"),
        }
    }

    #[test]
    fn brace_text_is_json() {
        match decoder().decode_text(r#"{"gameId":"G1"}"#) {
            DecodedFrame::Json(v) => assert_eq!(v["gameId"], "G1"),
            other => panic!("expected json, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_text_is_unknown_not_panic() {
        assert!(matches!(
            decoder().decode_text(r#"{"gameId": "#),
            DecodedFrame::Unknown { .. }
        ));
    }

    #[test]
    fn tiny_binary_is_heartbeat() {
        assert_eq!(decoder().decode_binary(&[0u8; 16]), DecodedFrame::Heartbeat);
        assert_eq!(decoder().decode_binary(&[1u8; 4]), DecodedFrame::Heartbeat);
    }

    #[test]
    fn deflate_json_is_the_native_path() {
        let payload = br#"{"gameId":"G1","old":1.90,"new":1.85}"#;
        let frame = deflate(payload);
        // Keep above heartbeat threshold.
        assert!(frame.len() > HEARTBEAT_MAX_LEN);
        match decoder().decode_binary(&frame) {
            DecodedFrame::Json(v) => assert_eq!(v["gameId"], "G1"),
            other => panic!("expected json, got {other:?}"),
        }
    }

    #[test]
    fn zlib_wrapped_json_decodes() {
        let payload =
            br#"{"gameId":"G2","old":2.0,"new":1.7,"padding":"xxxxxxxxxxxxxxxx"}"#;
        match decoder().decode_binary(&zlib(payload)) {
            DecodedFrame::Json(v) => assert_eq!(v["gameId"], "G2"),
            other => panic!("expected json, got {other:?}"),
        }
    }

    #[test]
    fn gzip_wrapped_json_decodes() {
        let payload =
            br#"{"gameId":"G3","old":2.0,"new":1.7,"padding":"xxxxxxxxxxxxxxxx"}"#;
        match decoder().decode_binary(&gzip(payload)) {
            DecodedFrame::Json(v) => assert_eq!(v["gameId"], "G3"),
            other => panic!("expected json, got {other:?}"),
        }
    }

    #[test]
    fn compressed_xml_routes_to_xml_path() {
        let payload = br#"<tick gameId="G4" old="2.0" new="1.7" type="total"/>"#;
        match decoder().decode_binary(&deflate(payload)) {
            DecodedFrame::Xml(s) => assert!(s.contains("G4")),
            other => panic!("expected xml, got {other:?}"),
        }
    }

    #[test]
    fn undecodable_binary_reports_hex_signature() {
        let junk: Vec<u8> = (0u8..64).map(|i| i.wrapping_mul(37)).collect();
        match decoder().decode_binary(&junk) {
            DecodedFrame::Unknown { signature } => {
                assert_eq!(signature.len(), SIGNATURE_BYTES * 2);
                assert_eq!(signature, hex::encode(&junk[..SIGNATURE_BYTES]));
            }
            other => panic!("expected unknown, got {other:?}"),
        }
    }
}
