//! The codec round-trips over a real byte stream, with frames arriving in
//! whatever chunks the transport felt like.

use bytes::{Bytes, BytesMut};
use codec::{Decoder, Encoder, IpPacket, Message, UdpInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn all_message_kinds_roundtrip_over_a_pipe() {
    // A tiny pipe buffer forces the reader to see partial frames.
    let (mut tx, mut rx) = tokio::io::duplex(64);

    let mut raw = vec![0u8; 300];
    raw[0] = 0x45;
    raw[9] = 17;
    raw[16..20].copy_from_slice(&[10, 0, 0, 3]);

    let messages = vec![
        Message::LocalAddr("192.168.69.2".parse().unwrap()),
        Message::UdpInfo(UdpInfo {
            port: 10201,
            key: [9u8; 32],
        }),
        Message::IpPkt(IpPacket::parse(Bytes::from(raw)).unwrap()),
    ];

    let mut wire = BytesMut::new();
    for message in &messages {
        Encoder::encode(message, &mut wire);
    }

    let writer = tokio::spawn(async move {
        tx.write_all(&wire).await.unwrap();
    });

    let mut buffer = BytesMut::new();
    let mut decoded = Vec::new();
    while decoded.len() < messages.len() {
        assert!(rx.read_buf(&mut buffer).await.unwrap() > 0);

        loop {
            match Decoder::message_size(&buffer).unwrap() {
                Some(size) if size <= buffer.len() => {
                    let frame = buffer.split_to(size);
                    decoded.push(Decoder::decode(&frame).unwrap());
                }
                _ => break,
            }
        }
    }

    writer.await.unwrap();
    assert_eq!(decoded, messages);
}
