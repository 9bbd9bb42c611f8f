//! ## Control stream wire format
//!
//! The control stream between a client and the server carries a sequence of
//! self-delimiting messages. Each message is a one-byte type tag, a four-byte
//! big-endian body length, and the body itself:
//!
//! ```text
//! 0      1              5
//! +------+--------------+----------------+
//! | tag  | body length  | body           |
//! +------+--------------+----------------+
//! ```
//!
//! Three message kinds exist. `IpPkt` carries one IPv4 datagram (destination
//! and protocol duplicated ahead of the raw bytes so the receiver does not
//! re-parse the header), `LocalAddr` announces the sender's tunnel address,
//! and `UdpInfo` negotiates the UDP datapath: the sender's receive port and
//! the 32-byte key the sender will use to encrypt the traffic it sends.
//!
//! There is no interoperability requirement with any external system; both
//! ends of the stream use this codec, and a decode error is fatal for the
//! connection that produced it.

pub mod crypto;

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

/// Tag and length prefix ahead of every message body.
pub const HEADER_SIZE: usize = 5;

/// Upper bound on a whole frame. A body can never legitimately exceed one
/// device-sized datagram plus the `IpPkt` preamble, so anything larger is a
/// corrupt or hostile stream.
pub const MAX_MESSAGE_SIZE: usize = 4096 + 64;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidInput,
    UnknownPacketType,
    PacketTooLarge,
    NotIpv4,
    CryptoFailed,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The type of the next message on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktType {
    IpPkt = 1,
    LocalAddr = 2,
    UdpInfo = 3,
}

impl TryFrom<u8> for PktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::IpPkt,
            2 => Self::LocalAddr,
            3 => Self::UdpInfo,
            _ => return Err(Error::UnknownPacketType),
        })
    }
}

/// One IPv4 datagram in transit over the tunnel.
///
/// The raw bytes are carried verbatim and never mutated in flight; the
/// destination and protocol are lifted out of the header once, on ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacket {
    pub raw: Bytes,
    pub dest: Ipv4Addr,
    pub protocol: u8,
}

impl IpPacket {
    /// Parse the IPv4 header of a datagram read from the device.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::Bytes;
    /// use overlink_codec::IpPacket;
    ///
    /// let mut raw = vec![0u8; 20];
    /// raw[0] = 0x45;
    /// raw[9] = 17;
    /// raw[16..20].copy_from_slice(&[10, 0, 0, 3]);
    ///
    /// let pkt = IpPacket::parse(Bytes::from(raw)).unwrap();
    /// assert_eq!(pkt.dest, "10.0.0.3".parse::<std::net::Ipv4Addr>().unwrap());
    /// assert_eq!(pkt.protocol, 17);
    /// ```
    pub fn parse(raw: Bytes) -> Result<Self, Error> {
        if raw.len() < 20 {
            return Err(Error::InvalidInput);
        }

        if raw[0] >> 4 != 4 {
            return Err(Error::NotIpv4);
        }

        Ok(Self {
            dest: Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]),
            protocol: raw[9],
            raw,
        })
    }

    /// Multicast destinations are never forwarded.
    pub fn is_multicast(&self) -> bool {
        self.dest.is_multicast()
    }
}

/// The UDP datapath control message: the sender's receive port, and the key
/// the sender will encrypt its outbound packets with. The receiver stores the
/// key as its recv key for this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpInfo {
    pub port: u16,
    pub key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    IpPkt(IpPacket),
    LocalAddr(Ipv4Addr),
    UdpInfo(UdpInfo),
}

impl Message {
    pub fn kind(&self) -> PktType {
        match self {
            Self::IpPkt(_) => PktType::IpPkt,
            Self::LocalAddr(_) => PktType::LocalAddr,
            Self::UdpInfo(_) => PktType::UdpInfo,
        }
    }
}

pub struct Encoder;

impl Encoder {
    /// Append one framed message to the buffer.
    pub fn encode(message: &Message, buf: &mut BytesMut) {
        buf.put_u8(message.kind() as u8);

        match message {
            Message::IpPkt(pkt) => {
                buf.put_u32((5 + pkt.raw.len()) as u32);
                buf.put_slice(&pkt.dest.octets());
                buf.put_u8(pkt.protocol);
                buf.put_slice(&pkt.raw);
            }
            Message::LocalAddr(addr) => {
                buf.put_u32(4);
                buf.put_slice(&addr.octets());
            }
            Message::UdpInfo(info) => {
                buf.put_u32(2 + 32);
                buf.put_u16(info.port);
                buf.put_slice(&info.key);
            }
        }
    }
}

pub struct Decoder;

impl Decoder {
    /// Size of the frame at the head of the buffer, or `None` when not even
    /// the header has arrived yet. The caller keeps reading until the whole
    /// frame is buffered, then hands it to [`Decoder::decode`].
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use overlink_codec::{Decoder, Encoder, Message};
    ///
    /// let mut buf = BytesMut::new();
    /// Encoder::encode(&Message::LocalAddr("10.0.0.2".parse().unwrap()), &mut buf);
    ///
    /// assert_eq!(Decoder::message_size(&buf).unwrap(), Some(9));
    /// assert_eq!(Decoder::message_size(&buf[..3]).unwrap(), None);
    /// ```
    pub fn message_size(buf: &[u8]) -> Result<Option<usize>, Error> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        PktType::try_from(buf[0])?;

        let body = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let total = HEADER_SIZE + body;
        if total > MAX_MESSAGE_SIZE {
            return Err(Error::PacketTooLarge);
        }

        Ok(Some(total))
    }

    /// Decode exactly one frame, header included.
    pub fn decode(frame: &[u8]) -> Result<Message, Error> {
        if frame.len() < HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        let kind = PktType::try_from(frame[0])?;
        let body = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        if frame.len() != HEADER_SIZE + body {
            return Err(Error::InvalidInput);
        }

        let body = &frame[HEADER_SIZE..];
        Ok(match kind {
            PktType::IpPkt => {
                if body.len() < 5 {
                    return Err(Error::InvalidInput);
                }

                Message::IpPkt(IpPacket {
                    dest: Ipv4Addr::new(body[0], body[1], body[2], body[3]),
                    protocol: body[4],
                    raw: Bytes::copy_from_slice(&body[5..]),
                })
            }
            PktType::LocalAddr => {
                if body.len() != 4 {
                    return Err(Error::InvalidInput);
                }

                Message::LocalAddr(Ipv4Addr::new(body[0], body[1], body[2], body[3]))
            }
            PktType::UdpInfo => {
                if body.len() != 2 + 32 {
                    return Err(Error::InvalidInput);
                }

                let mut key = [0u8; 32];
                key.copy_from_slice(&body[2..]);
                Message::UdpInfo(UdpInfo {
                    port: u16::from_be_bytes([body[0], body[1]]),
                    key,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_datagram(dest: [u8; 4], protocol: u8) -> Bytes {
        let mut raw = vec![0u8; 40];
        raw[0] = 0x45;
        raw[9] = protocol;
        raw[16..20].copy_from_slice(&dest);
        Bytes::from(raw)
    }

    fn roundtrip(message: Message) -> Message {
        let mut buf = BytesMut::new();
        Encoder::encode(&message, &mut buf);

        let size = Decoder::message_size(&buf).unwrap().unwrap();
        assert_eq!(size, buf.len());
        Decoder::decode(&buf).unwrap()
    }

    #[test]
    fn ip_pkt_roundtrip() {
        let pkt = IpPacket::parse(sample_datagram([10, 0, 0, 3], 6)).unwrap();
        let message = Message::IpPkt(pkt.clone());
        assert_eq!(roundtrip(message), Message::IpPkt(pkt));
    }

    #[test]
    fn local_addr_roundtrip() {
        let message = Message::LocalAddr(Ipv4Addr::new(192, 168, 69, 2));
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn udp_info_roundtrip() {
        let message = Message::UdpInfo(UdpInfo {
            port: 10201,
            key: [7u8; 32],
        });

        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn consecutive_frames_from_one_buffer() {
        let mut buf = BytesMut::new();
        Encoder::encode(&Message::LocalAddr(Ipv4Addr::new(10, 0, 0, 2)), &mut buf);
        Encoder::encode(
            &Message::IpPkt(IpPacket::parse(sample_datagram([10, 0, 0, 3], 17)).unwrap()),
            &mut buf,
        );

        let first = Decoder::message_size(&buf).unwrap().unwrap();
        let frame = buf.split_to(first);
        assert!(matches!(
            Decoder::decode(&frame).unwrap(),
            Message::LocalAddr(_)
        ));

        let second = Decoder::message_size(&buf).unwrap().unwrap();
        assert_eq!(second, buf.len());
        assert!(matches!(
            Decoder::decode(&buf).unwrap(),
            Message::IpPkt(_)
        ));
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let buf = [9u8, 0, 0, 0, 0];
        assert_eq!(
            Decoder::message_size(&buf).unwrap_err(),
            Error::UnknownPacketType
        );
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(PktType::IpPkt as u8);
        buf.put_u32(1 << 20);
        assert_eq!(
            Decoder::message_size(&buf).unwrap_err(),
            Error::PacketTooLarge
        );
    }

    #[test]
    fn non_ipv4_rejected() {
        let mut raw = vec![0u8; 40];
        raw[0] = 0x60;
        assert_eq!(
            IpPacket::parse(Bytes::from(raw)).unwrap_err(),
            Error::NotIpv4
        );
    }

    #[test]
    fn multicast_detection() {
        let pkt = IpPacket::parse(sample_datagram([224, 0, 0, 1], 17)).unwrap();
        assert!(pkt.is_multicast());

        let pkt = IpPacket::parse(sample_datagram([10, 0, 0, 3], 17)).unwrap();
        assert!(!pkt.is_multicast());
    }
}
