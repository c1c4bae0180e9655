// OEM Gateway - Sensor data relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Line-oriented frame decoding
//!
//! Stream listeners receive text frames separated by `\r\n`. Two layouts are
//! understood:
//!
//! - **Generic**: `NodeID val1 val2 ...`, at least one value.
//! - **RFM2Pi**: `NodeID lsb msb lsb msb ...`, each byte pair recombined into
//!   a signed 16-bit value. Lines starting with `>` or `->` are status output
//!   from the radio module and carry no data.

use std::str::FromStr;

use crate::error::{ListenerError, SettingError};
use crate::reading::{Measurement, NodeId, Reading};

/// Frame delimiter
const DELIMITER: &str = "\r\n";

/// Layout of the values inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// `NodeID val1 val2 ...`
    #[default]
    Generic,
    /// `NodeID lsb msb lsb msb ...`
    Rfm2Pi,
}

impl FromStr for FrameFormat {
    type Err = SettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generic" | "" => Ok(Self::Generic),
            "rfm2pi" => Ok(Self::Rfm2Pi),
            other => Err(SettingError::new(
                "frame_format",
                format!("unknown frame format '{}' (expected generic or rfm2pi)", other),
            )),
        }
    }
}

/// Decode one frame
///
/// Returns `Ok(None)` for informational lines that carry no data.
pub fn decode_frame(format: FrameFormat, frame: &str) -> Result<Option<Reading>, ListenerError> {
    match format {
        FrameFormat::Generic => decode_generic(frame).map(Some),
        FrameFormat::Rfm2Pi => decode_rfm2pi(frame),
    }
}

fn malformed(frame: &str) -> ListenerError {
    ListenerError::Acquisition(format!("Malformed frame: '{}'", frame.trim()))
}

fn decode_generic(frame: &str) -> Result<Reading, ListenerError> {
    let tokens: Vec<&str> = frame.split_whitespace().collect();
    if tokens.len() < 2 {
        return Err(malformed(frame));
    }

    let node: NodeId = tokens[0].parse().map_err(|_| malformed(frame))?;
    let values = tokens[1..]
        .iter()
        .map(|t| t.parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| malformed(frame))?;

    Ok(Reading::from_values(node, values))
}

fn decode_rfm2pi(frame: &str) -> Result<Option<Reading>, ListenerError> {
    let tokens: Vec<&str> = frame.split_whitespace().collect();

    if matches!(tokens.first(), Some(&">") | Some(&"->")) {
        return Ok(None);
    }

    // node + pairs of bytes: odd count, at least one pair
    if tokens.len() < 3 || tokens.len() % 2 == 0 {
        return Err(malformed(frame));
    }

    let bytes = tokens
        .iter()
        .map(|t| t.parse::<i64>().ok())
        .collect::<Option<Vec<i64>>>()
        .ok_or_else(|| malformed(frame))?;

    let node = NodeId::try_from(bytes[0]).map_err(|_| malformed(frame))?;
    let values = bytes[1..]
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            let mut value = pair[0] + 256 * pair[1];
            if value > 32768 {
                value -= 65536;
            }
            Measurement::new((i + 1).to_string(), value as f64)
        })
        .collect();

    Ok(Some(Reading::new(node, values)))
}

/// Accumulates raw bytes and yields complete frames
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: String,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Take the oldest complete frame, if any
    pub fn next_frame(&mut self) -> Option<String> {
        let end = self.pending.find(DELIMITER)?;
        let frame = self.pending[..end].to_string();
        self.pending.drain(..end + DELIMITER.len());
        Some(frame)
    }

    /// Bytes not yet returned as frames
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop an unterminated trailing frame, keeping complete ones
    ///
    /// Returns the number of bytes dropped.
    pub fn discard_partial(&mut self) -> usize {
        let keep = self
            .pending
            .rfind(DELIMITER)
            .map_or(0, |end| end + DELIMITER.len());
        let dropped = self.pending.len() - keep;
        self.pending.truncate(keep);
        dropped
    }

    /// Drop incomplete data
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_frame() {
        let reading = decode_frame(FrameFormat::Generic, "10 250 -12 3")
            .unwrap()
            .unwrap();
        assert_eq!(reading.node(), 10);
        let values: Vec<_> = reading.values().iter().map(|m| m.value).collect();
        assert_eq!(values, vec![Some(250.0), Some(-12.0), Some(3.0)]);
    }

    #[test]
    fn test_generic_frame_too_short() {
        let result = decode_frame(FrameFormat::Generic, "10");
        assert!(matches!(result, Err(ListenerError::Acquisition(_))));
    }

    #[test]
    fn test_generic_frame_not_numeric() {
        assert!(decode_frame(FrameFormat::Generic, "10 abc").is_err());
        assert!(decode_frame(FrameFormat::Generic, "node 1 2").is_err());
    }

    #[test]
    fn test_rfm2pi_frame_recombines_bytes() {
        // 0x0102 = 258, 0xFFFE = -2
        let reading = decode_frame(FrameFormat::Rfm2Pi, "5 2 1 254 255")
            .unwrap()
            .unwrap();
        assert_eq!(reading.node(), 5);
        assert_eq!(reading.value("1"), Some(258.0));
        assert_eq!(reading.value("2"), Some(-2.0));
    }

    #[test]
    fn test_rfm2pi_info_lines_skipped() {
        assert!(decode_frame(FrameFormat::Rfm2Pi, "> 15i").unwrap().is_none());
        assert!(decode_frame(FrameFormat::Rfm2Pi, "-> ack").unwrap().is_none());
    }

    #[test]
    fn test_rfm2pi_even_count_rejected() {
        assert!(decode_frame(FrameFormat::Rfm2Pi, "5 2 1 254").is_err());
        assert!(decode_frame(FrameFormat::Rfm2Pi, "5 2").is_err());
    }

    #[test]
    fn test_frame_format_parse() {
        assert_eq!("RFM2Pi".parse::<FrameFormat>().unwrap(), FrameFormat::Rfm2Pi);
        assert_eq!("".parse::<FrameFormat>().unwrap(), FrameFormat::Generic);
        assert!("csv".parse::<FrameFormat>().is_err());
    }

    #[test]
    fn test_frame_buffer_splits_and_retains() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"10 1 2\r\n11 3");
        assert_eq!(buffer.next_frame().as_deref(), Some("10 1 2"));
        assert_eq!(buffer.next_frame(), None);
        assert_eq!(buffer.pending_len(), 4);

        buffer.push(b" 4\r\n");
        assert_eq!(buffer.next_frame().as_deref(), Some("11 3 4"));
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_frame_buffer_discard_partial() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"10 1 2\r\n11 3");
        assert_eq!(buffer.discard_partial(), 4);
        assert_eq!(buffer.next_frame().as_deref(), Some("10 1 2"));
        assert_eq!(buffer.next_frame(), None);

        buffer.push(b"12 5");
        assert_eq!(buffer.discard_partial(), 4);
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.discard_partial(), 0);
    }
}
