//! UDP datagram parsing and construction - RFC 768

use crate::{Error, Result};

/// UDP header size
pub const HEADER_SIZE: usize = 8;

/// Parsed UDP header (zero-copy reference)
#[derive(Debug)]
pub struct UdpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn payload(&self) -> &'a [u8] {
        let end = (self.length() as usize).clamp(HEADER_SIZE, self.buffer.len());
        &self.buffer[HEADER_SIZE..end]
    }
}

/// Fill a UDP header in place. Checksum is zeroed for the caller to compute
/// over the final datagram with the pseudo-header.
pub fn fill_header(buf: &mut [u8], src_port: u16, dst_port: u16, payload_len: u16) {
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..6].copy_from_slice(&(payload_len + HEADER_SIZE as u16).to_be_bytes());
    buf[6..8].copy_from_slice(&[0, 0]);
}

pub fn set_checksum(buf: &mut [u8], csum: u16) {
    // All-zero means "no checksum" on the wire; transmit the complement form
    let wire = if csum == 0 { 0xffff } else { csum };
    buf[6..8].copy_from_slice(&wire.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_parse_round_trip() {
        let mut buf = [0u8; HEADER_SIZE + 4];
        fill_header(&mut buf, 55000, 53, 4);
        buf[HEADER_SIZE..].copy_from_slice(b"test");
        let uh = UdpHeader::parse(&buf).unwrap();
        assert_eq!(uh.src_port(), 55000);
        assert_eq!(uh.dst_port(), 53);
        assert_eq!(uh.length(), 12);
        assert_eq!(uh.payload(), b"test");
    }

    #[test]
    fn test_zero_checksum_substitution() {
        let mut buf = [0u8; HEADER_SIZE];
        fill_header(&mut buf, 1, 2, 0);
        set_checksum(&mut buf, 0);
        assert_eq!(&buf[6..8], &[0xff, 0xff]);
    }
}
