//! MQTT 3.1.1 serialization and deserialization.
//!
//! The codec is free of any I/O. Incoming bytes are accumulated in a
//! `BytesMut` by the transport and handed to [`mqtt_read`], which either
//! assembles one full packet (consuming its bytes) or reports how many more
//! bytes are needed. Outgoing packets are written into a `BytesMut` with
//! their `write` methods.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

mod packets;
pub use packets::*;

/// Errors during serialization and deserialization
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid packet type = {0}")]
    InvalidPacketType(u8),
    #[error("Invalid connect return code = {0}")]
    InvalidConnectReturnCode(u8),
    #[error("Invalid QoS = {0}")]
    InvalidQoS(u8),
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Payload size is incorrect")]
    PayloadSizeIncorrect,
    #[error("Payload is too long")]
    PayloadTooLong,
    #[error("Payload size limit exceeded = {0}")]
    PayloadSizeLimitExceeded(usize),
    #[error("Malformed remaining length")]
    MalformedRemainingLength,
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("At least {0} more bytes required to frame the packet")]
    InsufficientBytes(usize),
    #[error("Not valid utf8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Quality of service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Maps a number to QoS
pub fn qos(num: u8) -> Result<QoS, Error> {
    match num {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        n => Err(Error::InvalidQoS(n)),
    }
}

/// Packet type from the first byte of the fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// An MQTT control packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// Fixed header of a packet. The remaining length is a variable length
/// encoding (1 to 4 bytes) of the byte count after the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Packet type and flags
    pub byte1: u8,
    /// Length of the fixed header itself (1 + remaining-length bytes)
    pub header_len: usize,
    /// Number of bytes after the fixed header
    pub remaining_len: usize,
}

impl FixedHeader {
    /// Total length of the packet on the wire
    pub fn frame_length(&self) -> usize {
        self.header_len + self.remaining_len
    }
}

/// Parses the fixed header from the start of the stream without consuming
/// any bytes. Errors with `InsufficientBytes` until the full fixed header
/// has been buffered.
pub fn parse_fixed_header(stream: &[u8]) -> Result<FixedHeader, Error> {
    if stream.len() < 2 {
        return Err(Error::InsufficientBytes(2 - stream.len()));
    }

    let byte1 = stream[0];
    let mut remaining_len: usize = 0;
    let mut header_len = 1;
    let mut shift = 0;
    loop {
        if header_len >= stream.len() {
            return Err(Error::InsufficientBytes(1));
        }

        let byte = stream[header_len];
        header_len += 1;
        remaining_len += ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }

        // Remaining length can be at most 4 bytes
        shift += 7;
        if shift > 21 {
            return Err(Error::MalformedRemainingLength);
        }
    }

    Ok(FixedHeader { byte1, header_len, remaining_len })
}

/// Reads one packet from the stream. On success the packet's bytes are
/// consumed from the stream. Packets above `max_packet_size` are consumed
/// (once fully buffered) and reported as an error so that the stream stays
/// in sync.
pub fn mqtt_read(stream: &mut BytesMut, max_packet_size: usize) -> Result<Packet, Error> {
    let fixed_header = parse_fixed_header(&stream[..])?;
    let frame_length = fixed_header.frame_length();

    if fixed_header.remaining_len > max_packet_size {
        if stream.len() < frame_length {
            return Err(Error::InsufficientBytes(frame_length - stream.len()));
        }
        stream.advance(frame_length);
        return Err(Error::PayloadSizeLimitExceeded(fixed_header.remaining_len));
    }

    if stream.len() < frame_length {
        return Err(Error::InsufficientBytes(frame_length - stream.len()));
    }

    let packet = stream.split_to(frame_length).freeze();
    let control_type = fixed_header.byte1 >> 4;
    let packet = match control_type {
        1 => Packet::Connect(Connect::assemble(fixed_header, packet)?),
        2 => Packet::ConnAck(ConnAck::assemble(fixed_header, packet)?),
        3 => Packet::Publish(Publish::assemble(fixed_header, packet)?),
        8 => Packet::Subscribe(Subscribe::assemble(fixed_header, packet)?),
        9 => Packet::SubAck(SubAck::assemble(fixed_header, packet)?),
        10 => Packet::Unsubscribe(Unsubscribe::assemble(fixed_header, packet)?),
        11 => Packet::UnsubAck(UnsubAck::assemble(fixed_header, packet)?),
        12 => Packet::PingReq,
        13 => Packet::PingResp,
        14 => Packet::Disconnect,
        n => return Err(Error::InvalidPacketType(n)),
    };

    Ok(packet)
}

/// Writes one packet into the stream and returns the number of bytes written
pub fn mqtt_write(packet: &Packet, stream: &mut BytesMut) -> Result<usize, Error> {
    match packet {
        Packet::Connect(c) => c.write(stream),
        Packet::ConnAck(c) => c.write(stream),
        Packet::Publish(p) => p.write(stream),
        Packet::Subscribe(s) => s.write(stream),
        Packet::SubAck(s) => s.write(stream),
        Packet::Unsubscribe(u) => u.write(stream),
        Packet::UnsubAck(u) => u.write(stream),
        Packet::PingReq => {
            stream.put_slice(&[0xC0, 0x00]);
            Ok(2)
        }
        Packet::PingResp => {
            stream.put_slice(&[0xD0, 0x00]);
            Ok(2)
        }
        Packet::Disconnect => {
            stream.put_slice(&[0xE0, 0x00]);
            Ok(2)
        }
    }
}

pub(crate) fn read_mqtt_string(stream: &mut Bytes) -> Result<String, Error> {
    let s = read_mqtt_bytes(stream)?;
    Ok(String::from_utf8(s.to_vec())?)
}

pub(crate) fn read_mqtt_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    if stream.remaining() < 2 {
        return Err(Error::MalformedPacket);
    }
    let len = stream.get_u16() as usize;
    if stream.remaining() < len {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.split_to(len))
}

pub(crate) fn write_mqtt_string(stream: &mut BytesMut, string: &str) {
    stream.put_u16(string.len() as u16);
    stream.put_slice(string.as_bytes());
}

pub(crate) fn write_remaining_length(stream: &mut BytesMut, mut len: usize) -> Result<usize, Error> {
    if len > 268_435_455 {
        return Err(Error::PayloadTooLong);
    }

    let mut count = 0;
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        stream.put_u8(byte);
        count += 1;
        if len == 0 {
            break;
        }
    }

    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fixed_header_parsing_works_for_all_remaining_length_sizes() {
        let stream = &[0x30, 0x05, 1, 2, 3, 4, 5][..];
        let header = parse_fixed_header(stream).unwrap();
        assert_eq!(header, FixedHeader { byte1: 0x30, header_len: 2, remaining_len: 5 });

        let stream = &[0x30, 0x80, 0x01, 0xFF][..];
        let header = parse_fixed_header(stream).unwrap();
        assert_eq!(header, FixedHeader { byte1: 0x30, header_len: 3, remaining_len: 128 });

        let stream = &[0x30, 0xFF, 0xFF, 0xFF, 0x7F][..];
        let header = parse_fixed_header(stream).unwrap();
        assert_eq!(header.remaining_len, 268_435_455);
    }

    #[test]
    fn fixed_header_parsing_errors_on_malformed_remaining_length() {
        let stream = &[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..];
        match parse_fixed_header(stream) {
            Err(Error::MalformedRemainingLength) => (),
            v => panic!("Unexpected = {:?}", v),
        }
    }

    #[test]
    fn incomplete_packets_ask_for_more_bytes() {
        let mut stream = BytesMut::from(&[0xC0][..]);
        match mqtt_read(&mut stream, 1024) {
            Err(Error::InsufficientBytes(1)) => (),
            v => panic!("Unexpected = {:?}", v),
        }

        // Publish with 5 remaining bytes, only 3 buffered
        let mut stream = BytesMut::from(&[0x30, 0x05, 0x00, 0x01, b'a'][..]);
        match mqtt_read(&mut stream, 1024) {
            Err(Error::InsufficientBytes(2)) => (),
            v => panic!("Unexpected = {:?}", v),
        }
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn oversized_packets_are_consumed_and_reported() {
        let mut publish = BytesMut::new();
        let packet = Publish::new("a/b", QoS::AtMostOnce, vec![1u8; 64]);
        packet.write(&mut publish).unwrap();
        let total = publish.len();

        // Trailing pingreq must survive the discarded publish
        publish.put_slice(&[0xC0, 0x00]);

        let mut stream = publish;
        match mqtt_read(&mut stream, 16) {
            Err(Error::PayloadSizeLimitExceeded(len)) => assert_eq!(len, total - 2),
            v => panic!("Unexpected = {:?}", v),
        }
        let packet = mqtt_read(&mut stream, 16).unwrap();
        assert_eq!(packet, Packet::PingReq);
    }

    #[test]
    fn ping_and_disconnect_round_trip() {
        let mut stream = BytesMut::new();
        mqtt_write(&Packet::PingReq, &mut stream).unwrap();
        mqtt_write(&Packet::PingResp, &mut stream).unwrap();
        mqtt_write(&Packet::Disconnect, &mut stream).unwrap();

        assert_eq!(mqtt_read(&mut stream, 1024).unwrap(), Packet::PingReq);
        assert_eq!(mqtt_read(&mut stream, 1024).unwrap(), Packet::PingResp);
        assert_eq!(mqtt_read(&mut stream, 1024).unwrap(), Packet::Disconnect);
        assert_eq!(stream.len(), 0);
    }
}
