use crate::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Return code of a connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    RefusedProtocolVersion,
    RefusedClientId,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
}

/// Acknowledgement of a connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> ConnAck {
        ConnAck { session_present, code }
    }

    pub(crate) fn assemble(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        if fixed_header.remaining_len != 2 {
            return Err(Error::PayloadSizeIncorrect);
        }

        bytes.advance(fixed_header.header_len);
        let flags = bytes.get_u8();
        let code = match bytes.get_u8() {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::RefusedProtocolVersion,
            2 => ConnectReturnCode::RefusedClientId,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadCredentials,
            5 => ConnectReturnCode::NotAuthorized,
            n => return Err(Error::InvalidConnectReturnCode(n)),
        };

        let connack = ConnAck { session_present: (flags & 0x01) != 0, code };
        Ok(connack)
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<usize, Error> {
        stream.put_slice(&[0x20, 0x02, self.session_present as u8, self.code as u8]);
        Ok(4)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connack_stitching_works_correctly() {
        let stream = vec![
            0x20, 0x02, // packet type and remaining len
            0x01, 0x00, // session present, accepted
            0xDE, 0xAD, // extra bytes in the stream
        ];
        let mut stream = BytesMut::from(&stream[..]);

        let packet = mqtt_read(&mut stream, 1024).unwrap();
        assert_eq!(
            packet,
            Packet::ConnAck(ConnAck { session_present: true, code: ConnectReturnCode::Accepted })
        );
    }

    #[test]
    fn connack_rejects_unknown_return_codes() {
        let stream = vec![0x20, 0x02, 0x00, 0x09];
        let mut stream = BytesMut::from(&stream[..]);
        match mqtt_read(&mut stream, 1024) {
            Err(Error::InvalidConnectReturnCode(9)) => (),
            v => panic!("Unexpected = {:?}", v),
        }
    }
}
