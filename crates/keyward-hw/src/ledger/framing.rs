//! Ledger HID transport framing.
//!
//! An APDU is carried in fixed 64-byte packets. Every packet starts
//! with the channel id (big-endian u16), the APDU tag byte, and a
//! big-endian u16 sequence number. Packet 0 additionally carries the
//! total payload length as a big-endian u16 before the payload bytes.

use keyward_core::{KeywardError, Result};

pub const PACKET_SIZE: usize = 64;
pub const CHANNEL_ID: u16 = 0x0101;
pub const TAG_APDU: u8 = 0x05;

const FIRST_HEADER: usize = 7;
const CONT_HEADER: usize = 5;

/// Split an APDU into 64-byte packets.
pub fn wrap_apdu(apdu: &[u8]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut offset = 0usize;
    let mut seq: u16 = 0;
    loop {
        let mut packet = vec![0u8; PACKET_SIZE];
        packet[0..2].copy_from_slice(&CHANNEL_ID.to_be_bytes());
        packet[2] = TAG_APDU;
        packet[3..5].copy_from_slice(&seq.to_be_bytes());
        let header = if seq == 0 {
            packet[5..7].copy_from_slice(&(apdu.len() as u16).to_be_bytes());
            FIRST_HEADER
        } else {
            CONT_HEADER
        };
        let take = (apdu.len() - offset).min(PACKET_SIZE - header);
        packet[header..header + take].copy_from_slice(&apdu[offset..offset + take]);
        packets.push(packet);
        offset += take;
        seq += 1;
        if offset >= apdu.len() {
            break;
        }
    }
    packets
}

/// Incremental reassembly of a packet stream back into an APDU.
pub struct ApduReader {
    expected: Option<usize>,
    next_seq: u16,
    buf: Vec<u8>,
}

impl ApduReader {
    pub fn new() -> Self {
        Self {
            expected: None,
            next_seq: 0,
            buf: Vec::new(),
        }
    }

    /// Feed one packet. Returns the complete APDU once the declared
    /// length has been satisfied. Channel id, tag, and sequence are
    /// validated on every packet.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>> {
        if packet.len() < FIRST_HEADER {
            return Err(KeywardError::DeviceError(format!(
                "Short HID packet: {} bytes",
                packet.len()
            )));
        }
        let channel = u16::from_be_bytes([packet[0], packet[1]]);
        if channel != CHANNEL_ID {
            return Err(KeywardError::DeviceError(format!(
                "Unexpected channel id 0x{:04x}",
                channel
            )));
        }
        if packet[2] != TAG_APDU {
            return Err(KeywardError::DeviceError(format!(
                "Unexpected tag byte 0x{:02x}",
                packet[2]
            )));
        }
        let seq = u16::from_be_bytes([packet[3], packet[4]]);
        if seq != self.next_seq {
            return Err(KeywardError::DeviceError(format!(
                "Out-of-order packet: expected sequence {}, got {}",
                self.next_seq, seq
            )));
        }
        let payload = if seq == 0 {
            let total = u16::from_be_bytes([packet[5], packet[6]]) as usize;
            self.expected = Some(total);
            &packet[FIRST_HEADER..]
        } else {
            &packet[CONT_HEADER..]
        };
        let expected = self.expected.expect("set on packet 0");
        let missing = expected - self.buf.len();
        self.buf.extend_from_slice(&payload[..missing.min(payload.len())]);
        self.next_seq += 1;
        if self.buf.len() >= expected {
            Ok(Some(std::mem::take(&mut self.buf)))
        } else {
            Ok(None)
        }
    }
}

impl Default for ApduReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassemble a full packet sequence at once.
pub fn unwrap_apdu(packets: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut reader = ApduReader::new();
    for packet in packets {
        if let Some(apdu) = reader.feed(packet)? {
            return Ok(apdu);
        }
    }
    Err(KeywardError::DeviceError(
        "Packet stream ended before declared APDU length".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_apdu_uses_one_packet() {
        let packets = wrap_apdu(&[]);
        assert_eq!(packets.len(), 1);
        assert_eq!(unwrap_apdu(&packets).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn single_packet_roundtrip() {
        let apdu: Vec<u8> = (0..57).collect();
        let packets = wrap_apdu(&apdu);
        assert_eq!(packets.len(), 1);
        assert_eq!(unwrap_apdu(&packets).unwrap(), apdu);
    }

    #[test]
    fn boundary_spills_into_second_packet() {
        let apdu: Vec<u8> = (0..58).map(|i| i as u8).collect();
        let packets = wrap_apdu(&apdu);
        assert_eq!(packets.len(), 2);
        assert_eq!(unwrap_apdu(&packets).unwrap(), apdu);
    }

    #[test]
    fn multi_packet_roundtrip() {
        let apdu: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let packets = wrap_apdu(&apdu);
        assert!(packets.len() > 2);
        assert!(packets.iter().all(|p| p.len() == PACKET_SIZE));
        assert_eq!(unwrap_apdu(&packets).unwrap(), apdu);
    }

    #[test]
    fn rejects_wrong_channel() {
        let mut packets = wrap_apdu(&[1, 2, 3]);
        packets[0][0] = 0xde;
        assert!(unwrap_apdu(&packets).is_err());
    }

    #[test]
    fn rejects_wrong_tag() {
        let mut packets = wrap_apdu(&[1, 2, 3]);
        packets[0][2] = 0x06;
        assert!(unwrap_apdu(&packets).is_err());
    }

    #[test]
    fn rejects_out_of_order_sequence() {
        let apdu: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let packets = wrap_apdu(&apdu);
        let swapped = vec![packets[0].clone(), packets[2].clone(), packets[1].clone()];
        assert!(unwrap_apdu(&swapped).is_err());
    }

    #[test]
    fn truncated_stream_is_detected() {
        let apdu: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let mut packets = wrap_apdu(&apdu);
        packets.pop();
        assert!(unwrap_apdu(&packets).is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_for_any_length(len in 0usize..600) {
            let apdu: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let packets = wrap_apdu(&apdu);
            prop_assert_eq!(unwrap_apdu(&packets).unwrap(), apdu);
        }
    }
}
