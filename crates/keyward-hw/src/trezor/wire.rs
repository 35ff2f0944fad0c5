//! Trezor wire framing over 64-byte HID reports.
//!
//! The first report of a message is `'?' '#' '#'` followed by the
//! message type (big-endian u16) and the payload length (big-endian
//! u32), then payload bytes. Continuation reports carry a single `'?'`
//! prefix before more payload.

use keyward_core::{KeywardError, Result};

pub const REPORT_SIZE: usize = 64;

const MAGIC_CONT: u8 = b'?';
const MAGIC_HDR: u8 = b'#';

const FIRST_HEADER: usize = 9;
const CONT_HEADER: usize = 1;

/// Chunk a message into HID reports.
pub fn encode_message(msg_type: u16, payload: &[u8]) -> Vec<Vec<u8>> {
    let mut reports = Vec::new();
    let mut first = vec![0u8; REPORT_SIZE];
    first[0] = MAGIC_CONT;
    first[1] = MAGIC_HDR;
    first[2] = MAGIC_HDR;
    first[3..5].copy_from_slice(&msg_type.to_be_bytes());
    first[5..9].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    let take = payload.len().min(REPORT_SIZE - FIRST_HEADER);
    first[FIRST_HEADER..FIRST_HEADER + take].copy_from_slice(&payload[..take]);
    reports.push(first);

    let mut offset = take;
    while offset < payload.len() {
        let mut report = vec![0u8; REPORT_SIZE];
        report[0] = MAGIC_CONT;
        let take = (payload.len() - offset).min(REPORT_SIZE - CONT_HEADER);
        report[CONT_HEADER..CONT_HEADER + take]
            .copy_from_slice(&payload[offset..offset + take]);
        reports.push(report);
        offset += take;
    }
    reports
}

/// Incremental reassembly of reports into `(message type, payload)`.
pub struct MessageReader {
    msg_type: Option<u16>,
    expected: usize,
    buf: Vec<u8>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            msg_type: None,
            expected: 0,
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, report: &[u8]) -> Result<Option<(u16, Vec<u8>)>> {
        match self.msg_type {
            None => {
                if report.len() < FIRST_HEADER
                    || report[0] != MAGIC_CONT
                    || report[1] != MAGIC_HDR
                    || report[2] != MAGIC_HDR
                {
                    return Err(KeywardError::DeviceError(
                        "Malformed message header".into(),
                    ));
                }
                let msg_type = u16::from_be_bytes([report[3], report[4]]);
                let expected =
                    u32::from_be_bytes([report[5], report[6], report[7], report[8]]) as usize;
                self.msg_type = Some(msg_type);
                self.expected = expected;
                let payload = &report[FIRST_HEADER..];
                self.buf
                    .extend_from_slice(&payload[..payload.len().min(expected)]);
            }
            Some(_) => {
                if report.first() != Some(&MAGIC_CONT) {
                    return Err(KeywardError::DeviceError(
                        "Malformed continuation report".into(),
                    ));
                }
                let payload = &report[CONT_HEADER..];
                let missing = self.expected - self.buf.len();
                self.buf
                    .extend_from_slice(&payload[..payload.len().min(missing)]);
            }
        }
        if self.buf.len() >= self.expected {
            let msg_type = self.msg_type.take().expect("header parsed");
            self.expected = 0;
            return Ok(Some((msg_type, std::mem::take(&mut self.buf))));
        }
        Ok(None)
    }
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a complete report sequence at once.
pub fn decode_message(reports: &[Vec<u8>]) -> Result<(u16, Vec<u8>)> {
    let mut reader = MessageReader::new();
    for report in reports {
        if let Some(message) = reader.feed(report)? {
            return Ok(message);
        }
    }
    Err(KeywardError::DeviceError(
        "Report stream ended before declared message length".into(),
    ))
}
