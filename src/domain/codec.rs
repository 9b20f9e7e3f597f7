//! Radio payload codec for the LoRa P2P AT link
//!
//! Wire format:
//! - Outbound: ASCII payload hex-encoded, two lowercase digits per byte
//! - Inbound: modem lines containing `EVT:RXP2P`; the colon-separated
//!   token at index 4 carries the hex payload
//! - Decoded payload: `node_id[0..7] gateway_id[7..14] status[14..16] body[16..]`

/// Length of node and gateway identifiers in a radio payload
pub const ID_LEN: usize = 7;
/// Offset where the two-character status code starts
pub const STATUS_OFFSET: usize = 2 * ID_LEN;
/// Minimum decoded payload length (both ids plus status)
pub const MIN_FRAME_LEN: usize = STATUS_OFFSET + 2;

/// Marker emitted by the modem for inbound point-to-point payloads
pub const RX_EVENT_MARKER: &str = "EVT:RXP2P";

// Status codes exchanged with nodes
pub const STATUS_SENSOR_POLL: &str = "10";
pub const STATUS_ENROLL_ACCEPT: &str = "90";
pub const STATUS_ENROLL_REJECT: &str = "80";
pub const STATUS_RELAY_ACCEPT: &str = "92";
pub const STATUS_RELAY_REJECT: &str = "82";
pub const STATUS_UNENROLL_ACCEPT: &str = "97";
pub const STATUS_UNENROLL_REJECT: &str = "87";

/// Encode an ASCII message as lowercase hex, two digits per byte.
pub fn encode(message: &str) -> String {
    hex::encode(message.as_bytes())
}

/// Decode a hex payload to ASCII.
///
/// Returns `None` on odd length or a non-hex digit. Non-ASCII bytes map to
/// the replacement character so a corrupt frame never aborts the caller.
pub fn decode(hex_data: &str) -> Option<String> {
    let hex_data = hex_data.trim();
    if hex_data.len() % 2 != 0 {
        tracing::error!(len = hex_data.len(), "radio_hex_odd_length");
        return None;
    }

    let bytes = match hex::decode(hex_data) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "radio_hex_decode_failed");
            return None;
        }
    };

    Some(
        bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
            .collect(),
    )
}

/// Extract the hex payload from a raw modem line.
///
/// Returns `None` unless the line carries an `EVT:RXP2P` event with at least
/// five colon-separated tokens.
pub fn extract_frame_payload(line: &str) -> Option<&str> {
    if !line.contains(RX_EVENT_MARKER) {
        return None;
    }
    line.split(':').nth(4).map(str::trim)
}

/// A decoded inbound radio frame split into its fixed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub node_id: String,
    pub gateway_id: String,
    pub status: String,
    pub body: String,
}

impl ReplyFrame {
    /// Split a decoded ASCII payload into its fixed-offset fields.
    ///
    /// Works on characters rather than bytes: a corrupt frame may contain
    /// multi-byte replacement characters and must not panic on a slice
    /// boundary.
    pub fn parse(payload: &str) -> Option<ReplyFrame> {
        let chars: Vec<char> = payload.chars().collect();
        if chars.len() < MIN_FRAME_LEN {
            return None;
        }

        Some(ReplyFrame {
            node_id: chars[..ID_LEN].iter().collect(),
            gateway_id: chars[ID_LEN..STATUS_OFFSET].iter().collect(),
            status: chars[STATUS_OFFSET..MIN_FRAME_LEN].iter().collect(),
            body: chars[MIN_FRAME_LEN..].iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ascii() {
        assert_eq!(encode("N201001G10010110"), "4e323031303031473130303130313130");
        assert_eq!(encode(""), "");
    }

    #[test]
    fn test_encode_length_doubles() {
        let message = "N201001G100101209201";
        assert_eq!(encode(message).len(), 2 * message.len());
    }

    #[test]
    fn test_decode_round_trip() {
        for message in ["N201001G10010190", "abc", "25.5,60.2,1"] {
            assert_eq!(decode(&encode(message)).as_deref(), Some(message));
        }
    }

    #[test]
    fn test_decode_odd_length() {
        assert!(decode("4e32313").is_none());
    }

    #[test]
    fn test_decode_invalid_digit() {
        assert!(decode("4z").is_none());
    }

    #[test]
    fn test_decode_non_ascii_replaced() {
        assert_eq!(decode("ff41").as_deref(), Some("\u{FFFD}A"));
    }

    #[test]
    fn test_extract_frame_payload() {
        let line = "+EVT:RXP2P:-45:7:4E323031303031473130303130313930";
        assert_eq!(extract_frame_payload(line), Some("4E323031303031473130303130313930"));
    }

    #[test]
    fn test_extract_ignores_other_lines() {
        assert_eq!(extract_frame_payload("OK"), None);
        assert_eq!(extract_frame_payload("+EVT:TXP2P DONE"), None);
        assert_eq!(extract_frame_payload("+EVT:RXP2P:-45:7"), None);
    }

    #[test]
    fn test_reply_frame_parse() {
        let frame = ReplyFrame::parse("N201001G10010190").unwrap();
        assert_eq!(frame.node_id, "N201001");
        assert_eq!(frame.gateway_id, "G100101");
        assert_eq!(frame.status, "90");
        assert_eq!(frame.body, "");
    }

    #[test]
    fn test_reply_frame_parse_with_body() {
        let frame = ReplyFrame::parse("N201001G1001011025.5,60.2").unwrap();
        assert_eq!(frame.status, "10");
        assert_eq!(frame.body, "25.5,60.2");
    }

    #[test]
    fn test_reply_frame_too_short() {
        assert!(ReplyFrame::parse("N201001G10010").is_none());
    }

    #[test]
    fn test_enrollment_reply_decodes_end_to_end() {
        let line = "+EVT:RXP2P:-40:8:4E323031303031473130303130313930";
        let hex_payload = extract_frame_payload(line).unwrap();
        let ascii = decode(hex_payload).unwrap();
        let frame = ReplyFrame::parse(&ascii).unwrap();
        assert_eq!(frame.node_id, "N201001");
        assert_eq!(frame.status, STATUS_ENROLL_ACCEPT);
    }
}
