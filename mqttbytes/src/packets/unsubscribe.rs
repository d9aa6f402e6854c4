use crate::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Unsubscribe request
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

impl Unsubscribe {
    pub fn new<S: Into<String>>(pkid: u16, topic: S) -> Unsubscribe {
        Unsubscribe { pkid, topics: vec![topic.into()] }
    }

    fn len(&self) -> usize {
        let mut len = 2;
        for topic in &self.topics {
            len += 2 + topic.len();
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
            topics.push(read_mqtt_string(&mut bytes)?);
        }
        if topics.is_empty() {
            return Err(Error::MalformedPacket);
        }

        let unsubscribe = Unsubscribe { pkid, topics };
        Ok(unsubscribe)
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        stream.put_u8(0xA2);
        let count = write_remaining_length(stream, len)?;
        stream.put_u16(self.pkid);
        for topic in &self.topics {
            write_mqtt_string(stream, topic);
        }

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unsubscribe_round_trips_through_the_codec() {
        let unsubscribe = Unsubscribe::new(3, "a/b");
        let mut stream = BytesMut::new();
        unsubscribe.write(&mut stream).unwrap();

        assert_eq!(
            &stream[..],
            &[
                0xA2, 0x07, // packet type and remaining len
                0x00, 0x03, // pkid = 3
                0x00, 0x03, b'a', b'/', b'b', // topic filter
            ][..]
        );

        let packet = mqtt_read(&mut stream, 1024).unwrap();
        assert_eq!(packet, Packet::Unsubscribe(unsubscribe));
    }
}
