//! Loopback TCP round trip through the `mio`-backed socket table, mirroring
//! the wire framing `Context` uses internally.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use meshline::codec::{MessageBuilder, Packet};
use meshline::transport::{SocketTable, TransportEvent};

#[test]
fn message_sent_over_loopback_tcp_is_reassembled_whole() {
    let mut server = SocketTable::new().unwrap();
    let bind_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    let listener = server.listen_tcp(bind_addr).unwrap();
    let local_addr = server.local_addr(listener).unwrap();

    let mut client = SocketTable::new().unwrap();
    let client_handle = client.connect_tcp(local_addr).unwrap();

    let packet = Packet::Message(
        MessageBuilder::start("/synth/1/freq")
            .add_float(440.0)
            .finish(0.0, true),
    );
    client.enqueue(client_handle, packet.encode()).unwrap();
    client.send(client_handle, true).unwrap();

    let mut got = None;
    for _ in 0..50 {
        for event in server.poll(Some(Duration::from_millis(20))).unwrap() {
            if let TransportEvent::Message(_, bytes) = event {
                got = Some(bytes);
            }
        }
        if got.is_some() {
            break;
        }
        for event in client.poll(Some(Duration::from_millis(5))).unwrap() {
            let _ = event;
        }
    }

    let bytes = got.expect("server should have received the framed message");
    let decoded = Packet::decode(&bytes).unwrap();
    assert_eq!(decoded, packet);
}
