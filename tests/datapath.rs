//! The UDP handoff: keys exchanged in-band over the control stream, then
//! datagrams sealed by one side and opened by the other.

use bytes::{Bytes, BytesMut};
use codec::{Decoder, Encoder, IpPacket, Message, UdpInfo, crypto};

fn datagram(dest: [u8; 4]) -> Bytes {
    let mut raw = vec![0u8; 84];
    raw[0] = 0x45;
    raw[9] = 6;
    raw[16..20].copy_from_slice(&dest);
    Bytes::from(raw)
}

#[test]
fn client_packets_decrypt_under_the_announced_key() {
    // The client announces its send key in a UdpInfo frame, exactly as the
    // server would receive it off the control stream.
    let client_send_key = [11u8; 32];
    let mut frame = BytesMut::new();
    Encoder::encode(
        &Message::UdpInfo(UdpInfo {
            port: 40001,
            key: client_send_key,
        }),
        &mut frame,
    );

    let Message::UdpInfo(received) = Decoder::decode(&frame).unwrap() else {
        panic!("expected a UdpInfo frame");
    };

    // A packet the client ships over the datapath...
    let plaintext = datagram([10, 0, 0, 1]);
    let sealed = crypto::seal(&client_send_key, &plaintext).unwrap();

    // ...opens under the key the server received, and parses back into the
    // packet the dispatcher expects.
    let opened = crypto::open(&received.key, &sealed).unwrap();
    let pkt = IpPacket::parse(Bytes::from(opened)).unwrap();
    assert_eq!(pkt.raw, plaintext);
    assert_eq!(pkt.dest.octets(), [10, 0, 0, 1]);
}

#[test]
fn directions_do_not_share_keys() {
    let server_send_key = [1u8; 32];
    let client_send_key = [2u8; 32];

    let sealed = crypto::seal(&client_send_key, &datagram([10, 0, 0, 1])).unwrap();

    // The server-to-client key cannot open client-to-server traffic.
    assert!(crypto::open(&server_send_key, &sealed).is_err());
    assert!(crypto::open(&client_send_key, &sealed).is_ok());
}
