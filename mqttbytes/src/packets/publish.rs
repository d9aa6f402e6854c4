use crate::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Message on a topic
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Packet identifier. Zero for QoS 0 publishes
    pub pkid: u16,
    pub payload: Bytes,
}

impl Publish {
    pub fn new<S: Into<String>, P: Into<Bytes>>(topic: S, qos: QoS, payload: P) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            pkid: 0,
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    fn len(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }

    pub(crate) fn assemble(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        let qos = qos((fixed_header.byte1 & 0b0110) >> 1)?;
        let dup = (fixed_header.byte1 & 0b1000) != 0;
        let retain = (fixed_header.byte1 & 0b0001) != 0;

        bytes.advance(fixed_header.header_len);
        let topic = read_mqtt_string(&mut bytes)?;

        // Packet identifier exists where QoS > 0
        let pkid = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                if bytes.remaining() < 2 {
                    return Err(Error::MalformedPacket);
                }
                bytes.get_u16()
            }
        };

        let publish = Publish {
            dup,
            qos,
            retain,
            topic,
            pkid,
            payload: bytes,
        };

        Ok(publish)
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();

        let mut byte1 = 0x30 | ((self.qos as u8) << 1);
        if self.dup {
            byte1 |= 0b1000;
        }
        if self.retain {
            byte1 |= 0b0001;
        }

        stream.put_u8(byte1);
        let count = write_remaining_length(stream, len)?;
        write_mqtt_string(stream, &self.topic);
        if self.qos != QoS::AtMostOnce {
            stream.put_u16(self.pkid);
        }
        stream.put_slice(&self.payload);

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn qos0_publish_stitching_works_correctly() {
        let stream = vec![
            0x30, 0x09, // packet type and remaining len
            0x00, 0x04, b'a', b'/', b'b', b'c', // topic
            0x01, 0x02, 0x03, // payload
            0xDE, 0xAD, // extra bytes in the stream
        ];
        let mut stream = BytesMut::from(&stream[..]);

        let packet = mqtt_read(&mut stream, 1024).unwrap();
        let packet = match packet {
            Packet::Publish(packet) => packet,
            packet => panic!("Invalid packet = {:?}", packet),
        };

        assert_eq!(packet.topic, "a/bc");
        assert_eq!(packet.qos, QoS::AtMostOnce);
        assert_eq!(packet.pkid, 0);
        assert_eq!(&packet.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn qos1_publish_carries_a_packet_id() {
        let stream = vec![
            0x32, 0x09, // packet type (qos 1) and remaining len
            0x00, 0x03, b'a', b'/', b'b', // topic
            0x00, 0x0A, // pkid = 10
            0xF1, 0xF2, // payload
        ];
        let mut stream = BytesMut::from(&stream[..]);

        let packet = mqtt_read(&mut stream, 1024).unwrap();
        let packet = match packet {
            Packet::Publish(packet) => packet,
            packet => panic!("Invalid packet = {:?}", packet),
        };

        assert_eq!(packet.qos, QoS::AtLeastOnce);
        assert_eq!(packet.pkid, 10);
        assert_eq!(&packet.payload[..], &[0xF1, 0xF2]);
    }

    #[test]
    fn publish_write_matches_the_wire_format() {
        let publish = Publish::new("a/b", QoS::AtMostOnce, vec![0xF1, 0xF2, 0xF3]);
        let mut stream = BytesMut::new();
        let written = publish.write(&mut stream).unwrap();

        assert_eq!(written, stream.len());
        assert_eq!(
            &stream[..],
            &[
                0x30, 0x08, // packet type and remaining len
                0x00, 0x03, b'a', b'/', b'b', // topic
                0xF1, 0xF2, 0xF3, // payload
            ][..]
        );
    }
}
