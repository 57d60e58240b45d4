//! Modbus RTU frame building and parsing.
//!
//! Only the two function codes the instruments use are implemented: read
//! holding registers (0x03) and write single register (0x06). Frames end
//! with a CRC-16/MODBUS checksum transmitted low byte first.

use anyhow::{bail, Result};
use crc::{Crc, CRC_16_MODBUS};

/// Read holding registers.
pub const FN_READ_HOLDING: u8 = 0x03;
/// Write single register.
pub const FN_WRITE_SINGLE: u8 = 0x06;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Byte length of an exception response frame.
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Builds a read-holding-registers request frame.
pub fn read_holding_request(slave_id: u8, address: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave_id);
    frame.push(FN_READ_HOLDING);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Builds a write-single-register request frame.
pub fn write_single_request(slave_id: u8, address: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave_id);
    frame.push(FN_WRITE_SINGLE);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Expected byte length of the response to a read of `count` registers.
pub fn read_response_len(count: u16) -> usize {
    5 + 2 * count as usize
}

/// Expected byte length of the echo response to a single-register write.
pub const WRITE_RESPONSE_LEN: usize = 8;

/// Parses a read-holding-registers response, returning the register values.
pub fn parse_read_response(frame: &[u8], slave_id: u8, count: u16) -> Result<Vec<u16>> {
    check_common(frame, slave_id, FN_READ_HOLDING)?;
    let expected = read_response_len(count);
    if frame.len() != expected {
        bail!(
            "short read response: {} bytes, expected {}",
            frame.len(),
            expected
        );
    }
    let byte_count = frame[2] as usize;
    if byte_count != 2 * count as usize {
        bail!("byte count {} does not match {} registers", byte_count, count);
    }
    Ok(frame[3..3 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Parses the echo response to a single-register write.
pub fn parse_write_response(frame: &[u8], slave_id: u8, address: u16, value: u16) -> Result<()> {
    check_common(frame, slave_id, FN_WRITE_SINGLE)?;
    if frame.len() != WRITE_RESPONSE_LEN {
        bail!(
            "short write response: {} bytes, expected {}",
            frame.len(),
            WRITE_RESPONSE_LEN
        );
    }
    let echoed_address = u16::from_be_bytes([frame[2], frame[3]]);
    let echoed_value = u16::from_be_bytes([frame[4], frame[5]]);
    if echoed_address != address || echoed_value != value {
        bail!(
            "write echo mismatch: device acknowledged {:#06x}={}, requested {:#06x}={}",
            echoed_address,
            echoed_value,
            address,
            value
        );
    }
    Ok(())
}

fn append_crc(frame: &mut Vec<u8>) {
    let checksum = CRC16.checksum(frame);
    frame.extend_from_slice(&checksum.to_le_bytes());
}

fn check_common(frame: &[u8], slave_id: u8, function: u8) -> Result<()> {
    if frame.len() < EXCEPTION_FRAME_LEN {
        bail!("response truncated to {} bytes", frame.len());
    }
    let (payload, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = CRC16.checksum(payload);
    if received != computed {
        bail!("CRC mismatch: received {received:#06x}, computed {computed:#06x}");
    }
    if frame[0] != slave_id {
        bail!("response from station {} instead of {}", frame[0], slave_id);
    }
    if frame[1] == function | 0x80 {
        bail!("device exception: {}", exception_name(frame[2]));
    }
    if frame[1] != function {
        bail!(
            "unexpected function code {:#04x} in response to {:#04x}",
            frame[1],
            function
        );
    }
    Ok(())
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "device failure",
        0x06 => "device busy",
        _ => "unknown exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_crc(payload: &[u8]) -> Vec<u8> {
        let mut frame = payload.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn read_request_layout() {
        let frame = read_holding_request(1, 2103, 2);
        assert_eq!(&frame[..6], &[0x01, 0x03, 0x08, 0x37, 0x00, 0x02]);
        assert_eq!(frame.len(), 8);
        // CRC over the first six bytes must verify
        let (payload, crc_bytes) = frame.split_at(6);
        assert_eq!(
            CRC16.checksum(payload),
            u16::from_le_bytes([crc_bytes[0], crc_bytes[1]])
        );
    }

    #[test]
    fn write_echo_round_trip() {
        let request = write_single_request(16, 512, 1);
        // A well-behaved relay echoes the request verbatim.
        parse_write_response(&request, 16, 512, 1).expect("echo should parse");
    }

    #[test]
    fn read_response_parses_registers() {
        let frame = frame_with_crc(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x88, 0x94]);
        let regs = parse_read_response(&frame, 1, 2).expect("response should parse");
        assert_eq!(regs, vec![0x0001, 0x8894]);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let mut frame = frame_with_crc(&[0x01, 0x03, 0x02, 0x00, 0x05]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = parse_read_response(&frame, 1, 1).expect_err("must reject bad CRC");
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn exception_response_is_reported() {
        let frame = frame_with_crc(&[0x01, 0x83, 0x02]);
        let err = parse_read_response(&frame, 1, 1).expect_err("must reject exception");
        assert!(err.to_string().contains("illegal data address"));
    }

    #[test]
    fn wrong_station_is_rejected() {
        let frame = frame_with_crc(&[0x02, 0x03, 0x02, 0x00, 0x05]);
        let err = parse_read_response(&frame, 1, 1).expect_err("must reject wrong station");
        assert!(err.to_string().contains("station 2"));
    }
}
