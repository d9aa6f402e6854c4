use crate::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Connection request to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    /// Seconds the broker waits for activity before dropping the session
    pub keep_alive: u16,
    /// Client identifier
    pub client_id: String,
    /// Clean session. Asks the broker to throw away state of a previous session
    pub clean_session: bool,
    /// Will message published by the broker on ungraceful disconnection
    pub last_will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Connect {
    pub fn new<S: Into<String>>(client_id: S) -> Connect {
        Connect {
            keep_alive: 10,
            client_id: client_id.into(),
            clean_session: true,
            last_will: None,
            username: None,
            password: None,
        }
    }

    fn len(&self) -> usize {
        // Protocol name + level + connect flags + keep alive
        let mut len = 2 + "MQTT".len() + 1 + 1 + 2;
        len += 2 + self.client_id.len();
        if let Some(will) = &self.last_will {
            len += 2 + will.topic.len() + 2 + will.message.len();
        }
        if let Some(username) = &self.username {
            len += 2 + username.len();
        }
        if let Some(password) = &self.password {
            len += 2 + password.len();
        }
        len
    }

    pub(crate) fn assemble(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        bytes.advance(fixed_header.header_len);

        let protocol_name = read_mqtt_string(&mut bytes)?;
        if bytes.remaining() < 4 {
            return Err(Error::MalformedPacket);
        }
        let protocol_level = bytes.get_u8();
        if protocol_name != "MQTT" || protocol_level != 4 {
            return Err(Error::InvalidProtocol);
        }

        let connect_flags = bytes.get_u8();
        let clean_session = (connect_flags & 0b10) != 0;
        let keep_alive = bytes.get_u16();
        let client_id = read_mqtt_string(&mut bytes)?;

        let last_will = if connect_flags & 0b0000_0100 != 0 {
            let topic = read_mqtt_string(&mut bytes)?;
            let message = read_mqtt_bytes(&mut bytes)?;
            let qos = qos((connect_flags & 0b0001_1000) >> 3)?;
            let retain = (connect_flags & 0b0010_0000) != 0;
            Some(LastWill { topic, message, qos, retain })
        } else {
            None
        };

        let username = if connect_flags & 0b1000_0000 != 0 {
            Some(read_mqtt_string(&mut bytes)?)
        } else {
            None
        };
        let password = if connect_flags & 0b0100_0000 != 0 {
            Some(read_mqtt_string(&mut bytes)?)
        } else {
            None
        };

        let connect = Connect {
            keep_alive,
            client_id,
            clean_session,
            last_will,
            username,
            password,
        };

        Ok(connect)
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        stream.put_u8(0x10);
        let count = write_remaining_length(stream, len)?;
        write_mqtt_string(stream, "MQTT");
        stream.put_u8(0x04);

        let mut connect_flags = 0;
        if self.clean_session {
            connect_flags |= 0b10;
        }
        if let Some(will) = &self.last_will {
            connect_flags |= 0b0000_0100 | ((will.qos as u8) << 3);
            if will.retain {
                connect_flags |= 0b0010_0000;
            }
        }
        if self.username.is_some() {
            connect_flags |= 0b1000_0000;
        }
        if self.password.is_some() {
            connect_flags |= 0b0100_0000;
        }

        stream.put_u8(connect_flags);
        stream.put_u16(self.keep_alive);
        write_mqtt_string(stream, &self.client_id);
        if let Some(will) = &self.last_will {
            write_mqtt_string(stream, &will.topic);
            stream.put_u16(will.message.len() as u16);
            stream.put_slice(&will.message);
        }
        if let Some(username) = &self.username {
            write_mqtt_string(stream, username);
        }
        if let Some(password) = &self.password {
            write_mqtt_string(stream, password);
        }

        Ok(1 + count + len)
    }
}

/// Will message the broker publishes when the client dies ungracefully
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connect_stitching_works_correctly() {
        let stream = vec![
            0x10, 36, // packet type and remaining len
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, // protocol name and level
            0b1100_0010, // connect flags: username, password, clean session
            0x00, 0x0A, // keep alive = 10
            0x00, 0x04, b't', b'e', b's', b't', // client id
            0x00, 0x08, b'u', b's', b'e', b'r', b'n', b'a', b'm', b'e',
            0x00, 0x08, b'p', b'a', b's', b's', b'w', b'o', b'r', b'd',
            0xDE, 0xAD, // extra bytes in the stream
        ];
        let mut stream = BytesMut::from(&stream[..]);

        let packet = mqtt_read(&mut stream, 1024).unwrap();
        let packet = match packet {
            Packet::Connect(packet) => packet,
            packet => panic!("Invalid packet = {:?}", packet),
        };

        assert_eq!(
            packet,
            Connect {
                keep_alive: 10,
                client_id: "test".to_owned(),
                clean_session: true,
                last_will: None,
                username: Some("username".to_owned()),
                password: Some("password".to_owned()),
            }
        );
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn connect_write_matches_the_wire_format() {
        let mut connect = Connect::new("test");
        connect.keep_alive = 400;
        let mut stream = BytesMut::new();
        connect.write(&mut stream).unwrap();

        assert_eq!(
            &stream[..],
            &[
                0x10, 16, // packet type and remaining len
                0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, // protocol name and level
                0b0000_0010, // clean session
                0x01, 0x90, // keep alive = 400
                0x00, 0x04, b't', b'e', b's', b't', // client id
            ][..]
        );
    }
}
