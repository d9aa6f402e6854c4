use crate::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Subscription request
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub pkid: u16,
    pub topics: Vec<SubscribeTopic>,
}

/// Subscription filter with its requested QoS
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeTopic {
    pub topic_path: String,
    pub qos: QoS,
}

impl Subscribe {
    pub fn new<S: Into<String>>(pkid: u16, topic: S, qos: QoS) -> Subscribe {
        let topic = SubscribeTopic { topic_path: topic.into(), qos };
        Subscribe { pkid, topics: vec![topic] }
    }

    fn len(&self) -> usize {
        let mut len = 2;
        for topic in &self.topics {
            len += 2 + topic.topic_path.len() + 1;
        }
        len
    }

    pub(crate) fn assemble(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        bytes.advance(fixed_header.header_len);
        if bytes.remaining() < 2 {
            return Err(Error::MalformedPacket);
        }
        let pkid = bytes.get_u16();

        let mut topics = Vec::new();
        while bytes.has_remaining() {
            let topic_path = read_mqtt_string(&mut bytes)?;
            if !bytes.has_remaining() {
                return Err(Error::MalformedPacket);
            }
            let qos = qos(bytes.get_u8() & 0x3)?;
            topics.push(SubscribeTopic { topic_path, qos });
        }

        if topics.is_empty() {
            return Err(Error::MalformedPacket);
        }

        let subscribe = Subscribe { pkid, topics };
        Ok(subscribe)
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        stream.put_u8(0x82);
        let count = write_remaining_length(stream, len)?;
        stream.put_u16(self.pkid);
        for topic in &self.topics {
            write_mqtt_string(stream, &topic.topic_path);
            stream.put_u8(topic.qos as u8);
        }

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn subscribe_stitching_works_correctly() {
        let stream = vec![
            0x82, 0x08, // packet type and remaining len
            0x00, 0x01, // pkid = 1
            0x00, 0x03, b'a', b'/', b'b', // topic filter
            0x00, // requested qos
            0xDE, 0xAD, // extra bytes in the stream
        ];
        let mut stream = BytesMut::from(&stream[..]);

        let packet = mqtt_read(&mut stream, 1024).unwrap();
        assert_eq!(
            packet,
            Packet::Subscribe(Subscribe {
                pkid: 1,
                topics: vec![SubscribeTopic { topic_path: "a/b".to_owned(), qos: QoS::AtMostOnce }],
            })
        );
    }

    #[test]
    fn subscribe_write_matches_the_wire_format() {
        let subscribe = Subscribe::new(10, "a/b", QoS::AtMostOnce);
        let mut stream = BytesMut::new();
        subscribe.write(&mut stream).unwrap();

        assert_eq!(
            &stream[..],
            &[
                0x82, 0x08, // packet type and remaining len
                0x00, 0x0A, // pkid = 10
                0x00, 0x03, b'a', b'/', b'b', // topic filter
                0x00, // requested qos
            ][..]
        );
    }
}
