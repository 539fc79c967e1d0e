//! Parsing and serializing of the uTP wire format.

use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;
use nom::{be_u16, be_u32, be_u8, ErrorKind, IResult, Needed};

use crate::PROTOCOL_VERSION;

/// Size of the fixed uTP header.
pub const HEADER_SIZE: usize = 20;

/// End of the extension chain.
const EXTENSION_NONE: u8 = 0;

/// Selective ack bitmask extension.
const EXTENSION_SACK: u8 = 1;

/// Close reason extension.
const EXTENSION_CLOSE_REASON: u8 = 3;

/// Largest selective ack bitmask we will emit, in bytes.
pub const MAX_SACK_BYTES: usize = 32;

/// Enumerates the uTP packet types.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PacketType {
    /// Payload carrying segment.
    Data,
    /// Finalize the connection.
    Fin,
    /// Acknowledgment without payload.
    State,
    /// Forcefully terminate the connection.
    Reset,
    /// Initiate a connection.
    Syn,
}

impl PacketType {
    /// Map the high header nibble to a packet type.
    pub fn from_nibble(nibble: u8) -> Option<PacketType> {
        match nibble {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }

    /// Map the packet type to the high header nibble.
    pub fn to_nibble(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Fin => 1,
            PacketType::State => 2,
            PacketType::Reset => 3,
            PacketType::Syn => 4,
        }
    }
}

/// Extensions chained behind the uTP header.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PacketExtension {
    /// Bitmask of received segments past the cumulative ack.
    Sack(Vec<u8>),
    /// Reason code attached to a FIN or RESET.
    CloseReason(u16),
    /// Extension we do not understand, carried opaquely.
    Unknown(u8, Vec<u8>),
}

impl PacketExtension {
    fn type_byte(&self) -> u8 {
        match self {
            PacketExtension::Sack(_) => EXTENSION_SACK,
            PacketExtension::CloseReason(_) => EXTENSION_CLOSE_REASON,
            PacketExtension::Unknown(ext_type, _) => *ext_type,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            PacketExtension::Sack(mask) => mask.len(),
            PacketExtension::CloseReason(_) => 4,
            PacketExtension::Unknown(_, payload) => payload.len(),
        }
    }
}

/// One uTP packet, header plus extensions plus payload.
#[derive(Clone, PartialEq, Debug)]
pub struct UtpPacket {
    pub packet_type: PacketType,
    pub conn_id: u16,
    pub timestamp_micros: u32,
    pub timestamp_diff_micros: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub extensions: Vec<PacketExtension>,
    pub payload: Bytes,
}

impl UtpPacket {
    /// Parse a packet from the given datagram bytes.
    pub fn from_bytes(bytes: &[u8]) -> IResult<&[u8], UtpPacket> {
        parse_packet(bytes)
    }

    /// Write the packet to the given writer, bit exact.
    pub fn write_bytes<W>(&self, mut writer: W) -> io::Result<()>
    where
        W: Write,
    {
        let first_extension = self
            .extensions
            .first()
            .map(|ext| ext.type_byte())
            .unwrap_or(EXTENSION_NONE);

        writer.write_u8((self.packet_type.to_nibble() << 4) | PROTOCOL_VERSION)?;
        writer.write_u8(first_extension)?;
        writer.write_u16::<BigEndian>(self.conn_id)?;
        writer.write_u32::<BigEndian>(self.timestamp_micros)?;
        writer.write_u32::<BigEndian>(self.timestamp_diff_micros)?;
        writer.write_u32::<BigEndian>(self.wnd_size)?;
        writer.write_u16::<BigEndian>(self.seq_nr)?;
        writer.write_u16::<BigEndian>(self.ack_nr)?;

        for (index, extension) in self.extensions.iter().enumerate() {
            let next_type = self
                .extensions
                .get(index + 1)
                .map(|ext| ext.type_byte())
                .unwrap_or(EXTENSION_NONE);

            writer.write_u8(next_type)?;
            writer.write_u8(extension.payload_len() as u8)?;

            match extension {
                PacketExtension::Sack(mask) => writer.write_all(mask)?,
                PacketExtension::CloseReason(code) => {
                    writer.write_u16::<BigEndian>(0)?;
                    writer.write_u16::<BigEndian>(*code)?;
                }
                PacketExtension::Unknown(_, payload) => writer.write_all(payload)?,
            }
        }

        writer.write_all(&self.payload)
    }

    /// Total size of the packet on the wire.
    pub fn wire_len(&self) -> usize {
        let extensions: usize = self.extensions.iter().map(|ext| 2 + ext.payload_len()).sum();

        HEADER_SIZE + extensions + self.payload.len()
    }

    /// Selective ack bitmask carried by this packet, if any.
    pub fn sack(&self) -> Option<&[u8]> {
        self.extensions.iter().find_map(|ext| match ext {
            PacketExtension::Sack(mask) => Some(&mask[..]),
            _ => None,
        })
    }

    /// Close reason carried by this packet, if any.
    pub fn close_reason(&self) -> Option<u16> {
        self.extensions.iter().find_map(|ext| match ext {
            PacketExtension::CloseReason(code) => Some(*code),
            _ => None,
        })
    }
}

fn parse_packet(bytes: &[u8]) -> IResult<&[u8], UtpPacket> {
    let (rest, (type_version, first_extension, conn_id, timestamp, timestamp_diff, wnd_size, seq_nr, ack_nr)) = try_parse!(
        bytes,
        tuple!(be_u8, be_u8, be_u16, be_u32, be_u32, be_u32, be_u16, be_u16)
    );

    if type_version & 0x0F != PROTOCOL_VERSION {
        return IResult::Error(ErrorKind::Custom(0));
    }
    let packet_type = match PacketType::from_nibble(type_version >> 4) {
        Some(packet_type) => packet_type,
        None => return IResult::Error(ErrorKind::Custom(1)),
    };

    let mut extensions = Vec::new();
    let mut extension_type = first_extension;
    let mut remaining = rest;

    while extension_type != EXTENSION_NONE {
        if remaining.len() < 2 {
            return IResult::Incomplete(Needed::Size(2));
        }
        let next_type = remaining[0];
        let length = remaining[1] as usize;
        if remaining.len() < 2 + length {
            return IResult::Incomplete(Needed::Size(2 + length));
        }
        let payload = &remaining[2..2 + length];

        let extension = match extension_type {
            EXTENSION_SACK => PacketExtension::Sack(payload.to_vec()),
            EXTENSION_CLOSE_REASON if length >= 4 => {
                let code = (u16::from(payload[2]) << 8) | u16::from(payload[3]);
                PacketExtension::CloseReason(code)
            }
            other => PacketExtension::Unknown(other, payload.to_vec()),
        };
        extensions.push(extension);

        extension_type = next_type;
        remaining = &remaining[2 + length..];
    }

    let packet = UtpPacket {
        packet_type,
        conn_id,
        timestamp_micros: timestamp,
        timestamp_diff_micros: timestamp_diff,
        wnd_size,
        seq_nr,
        ack_nr,
        extensions,
        payload: Bytes::from(remaining),
    };

    IResult::Done(&[][..], packet)
}

#[cfg(test)]
mod tests {
    use super::{PacketExtension, PacketType, UtpPacket};

    use bytes::Bytes;
    use nom::IResult;

    fn sample_packet() -> UtpPacket {
        UtpPacket {
            packet_type: PacketType::Data,
            conn_id: 0x1234,
            timestamp_micros: 0xDEADBEEF,
            timestamp_diff_micros: 0x01020304,
            wnd_size: 0x00100000,
            seq_nr: 0x0005,
            ack_nr: 0x0006,
            extensions: Vec::new(),
            payload: Bytes::from(&b"hello"[..]),
        }
    }

    #[test]
    fn positive_write_header_bit_exact() {
        let mut buffer = Vec::new();
        sample_packet().write_bytes(&mut buffer).unwrap();

        let expected = [
            0x01, 0x00, // ST_DATA, version 1, no extensions
            0x12, 0x34, // connection id
            0xDE, 0xAD, 0xBE, 0xEF, // timestamp
            0x01, 0x02, 0x03, 0x04, // timestamp difference
            0x00, 0x10, 0x00, 0x00, // advertised window
            0x00, 0x05, // seq_nr
            0x00, 0x06, // ack_nr
            b'h', b'e', b'l', b'l', b'o',
        ];
        assert_eq!(&expected[..], &buffer[..]);
    }

    #[test]
    fn positive_round_trip_with_extensions() {
        let mut packet = sample_packet();
        packet.extensions = vec![
            PacketExtension::Sack(vec![0b0000_1010, 0, 0, 0]),
            PacketExtension::CloseReason(3),
        ];

        let mut buffer = Vec::new();
        packet.write_bytes(&mut buffer).unwrap();

        match UtpPacket::from_bytes(&buffer) {
            IResult::Done(rest, parsed) => {
                assert!(rest.is_empty());
                assert_eq!(packet, parsed);
            }
            other => panic!("Failed To Parse Round Trip Packet: {:?}", other),
        }
    }

    #[test]
    fn positive_sack_accessor() {
        let mut packet = sample_packet();
        packet.extensions = vec![PacketExtension::Sack(vec![1, 2, 3, 4])];

        assert_eq!(Some(&[1u8, 2, 3, 4][..]), packet.sack());
        assert_eq!(None, packet.close_reason());
    }

    #[test]
    fn negative_bad_version_rejected() {
        let mut buffer = Vec::new();
        sample_packet().write_bytes(&mut buffer).unwrap();
        buffer[0] = (buffer[0] & 0xF0) | 0x02;

        match UtpPacket::from_bytes(&buffer) {
            IResult::Error(_) => {}
            other => panic!("Expected A Version Error: {:?}", other),
        }
    }

    #[test]
    fn negative_unknown_type_rejected() {
        let mut buffer = Vec::new();
        sample_packet().write_bytes(&mut buffer).unwrap();
        buffer[0] = (0x07 << 4) | 0x01;

        match UtpPacket::from_bytes(&buffer) {
            IResult::Error(_) => {}
            other => panic!("Expected A Type Error: {:?}", other),
        }
    }

    #[test]
    fn negative_truncated_header_incomplete() {
        let buffer = [0x01u8, 0x00, 0x12];

        match UtpPacket::from_bytes(&buffer) {
            IResult::Incomplete(_) => {}
            other => panic!("Expected Incomplete: {:?}", other),
        }
    }

    #[test]
    fn positive_syn_state_round_trip() {
        for packet_type in [PacketType::Syn, PacketType::State, PacketType::Fin, PacketType::Reset].iter() {
            let mut packet = sample_packet();
            packet.packet_type = *packet_type;
            packet.payload = Bytes::new();

            let mut buffer = Vec::new();
            packet.write_bytes(&mut buffer).unwrap();

            match UtpPacket::from_bytes(&buffer) {
                IResult::Done(_, parsed) => assert_eq!(packet, parsed),
                other => panic!("Failed To Parse: {:?}", other),
            }
        }
    }
}
