use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chatter_ws::frame::{Frame, FrameDecoder, OpCode, close_payload, encode_frame};
use chatter_ws::{
    Config, Connection, ConnectionHandle, ConnectionState, Error, Event, HandshakeError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc;

const REQUEST: &[u8] = b"GET /room HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Protocol: json\r\n\
    Sec-WebSocket-Version: 13\r\n\
    \r\n";

const MASK: [u8; 4] = [0x0f, 0xf0, 0xaa, 0x55];

/// Client end of the socket
struct Peer {
    io: DuplexStream,
    decoder: FrameDecoder,
}

impl Peer {
    async fn send(&mut self, opcode: OpCode, payload: &[u8]) {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, true, Some(MASK));
        self.io.write_all(&buf).await.unwrap();
    }

    async fn read_head(&mut self) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            assert_eq!(self.io.read(&mut byte).await.unwrap(), 1, "socket closed");
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn read_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return Some(frame);
            }
            let mut buf = [0u8; 1024];
            let n = self.io.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            self.decoder.extend(&buf[..n]);
        }
    }
}

async fn connect(config: Config) -> (Connection<DuplexStream>, Peer) {
    let (client, server) = duplex(256 * 1024);
    let mut peer = Peer {
        io: client,
        decoder: FrameDecoder::new(1 << 20, false),
    };
    peer.io.write_all(REQUEST).await.unwrap();

    let conn = Connection::accept(server, config).await.unwrap();
    let head = peer.read_head().await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    (conn, peer)
}

#[tokio::test]
async fn echo_with_pull_api() {
    let config = Config::builder().protocol("json").build();
    let (mut conn, mut peer) = connect(config).await;
    assert_eq!(conn.subprotocol(), Some("json"));
    assert_eq!(conn.path(), Some("/room"));

    peer.send(OpCode::Text, b"hello").await;
    let event = conn.next_event().await.unwrap();
    assert_eq!(
        event,
        Event::Message {
            payload: Bytes::from_static(b"hello"),
            is_text: true
        }
    );

    conn.send(b"hello back", true).await.unwrap();
    let frame = peer.read_frame().await.unwrap();
    assert_eq!(frame.header.opcode, OpCode::Text);
    assert!(!frame.header.masked);
    assert_eq!(&frame.payload[..], b"hello back");
}

#[tokio::test]
async fn large_binary_message_spans_reads() {
    let (mut conn, mut peer) = connect(Config::default()).await;
    let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();

    peer.send(OpCode::Binary, &payload).await;
    match conn.next_event().await.unwrap() {
        Event::Message { payload: got, is_text } => {
            assert!(!is_text);
            assert_eq!(&got[..], &payload[..]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn peer_close_is_echoed_and_sends_fail() {
    let (mut conn, mut peer) = connect(Config::default()).await;

    peer.send(OpCode::Close, &close_payload(1000, "bye")).await;
    assert_eq!(
        conn.next_event().await,
        Some(Event::PeerClose {
            code: 1000,
            reason: "bye".into()
        })
    );

    // Echo is written and the socket shut down before the stream ends
    assert_eq!(conn.next_event().await, None);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(
        conn.send(b"too late", true).await,
        Err(Error::ConnectionClosed)
    ));

    let frame = peer.read_frame().await.unwrap();
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(frame.payload, close_payload(1000, ""));
    assert!(peer.read_frame().await.is_none());
}

#[tokio::test]
async fn peer_disconnect_reports_abnormal_close() {
    let (mut conn, peer) = connect(Config::default()).await;
    drop(peer);

    assert_eq!(
        conn.next_event().await,
        Some(Event::PeerClose {
            code: 1006,
            reason: String::new()
        })
    );
    assert_eq!(conn.next_event().await, None);
}

#[tokio::test]
async fn protocol_violation_sends_1002() {
    let (mut conn, mut peer) = connect(Config::default()).await;

    // Unmasked client frame
    peer.io.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();
    assert_eq!(
        conn.next_event().await,
        Some(Event::Error(chatter_ws::ErrorKind::ProtocolViolation))
    );
    assert_eq!(conn.next_event().await, None);

    let frame = peer.read_frame().await.unwrap();
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(frame.payload, close_payload(1002, ""));
}

#[tokio::test]
async fn local_close_times_out_without_reply() {
    let config = Config::builder()
        .close_timeout(Duration::from_millis(50))
        .build();
    let (mut conn, mut peer) = connect(config).await;

    conn.send_close(1001, "shutting down").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closing);

    let frame = peer.read_frame().await.unwrap();
    assert_eq!(frame.payload, close_payload(1001, "shutting down"));

    // Peer never answers
    assert_eq!(conn.next_event().await, None);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn bad_handshake_gets_400() {
    let (mut client, server) = duplex(4096);
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();

    let err = Connection::accept(server, Config::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Handshake(HandshakeError::MissingHeader("Upgrade"))
    ));

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn run_loop_forwards_events_and_commands() {
    let (conn, mut peer) = connect(Config::default()).await;
    let (events_tx, mut events_rx) = mpsc::channel(8);
    let (handle, commands_rx) = ConnectionHandle::channel(8);

    let task = tokio::spawn(conn.run(events_tx, commands_rx, |event| (7u64, event)));

    peer.send(OpCode::Text, b"one").await;
    peer.send(OpCode::Binary, b"two").await;
    assert_eq!(
        events_rx.recv().await,
        Some((
            7,
            Event::Message {
                payload: Bytes::from_static(b"one"),
                is_text: true
            }
        ))
    );
    assert_eq!(
        events_rx.recv().await,
        Some((
            7,
            Event::Message {
                payload: Bytes::from_static(b"two"),
                is_text: false
            }
        ))
    );

    handle.send(Bytes::from_static(b"reply"), true).await.unwrap();
    let frame = peer.read_frame().await.unwrap();
    assert_eq!(&frame.payload[..], b"reply");

    // Ping is answered by the loop itself
    peer.send(OpCode::Ping, b"are you there").await;
    let frame = peer.read_frame().await.unwrap();
    assert_eq!(frame.header.opcode, OpCode::Pong);
    assert_eq!(&frame.payload[..], b"are you there");

    handle.close(1000, "done").await.unwrap();
    let frame = peer.read_frame().await.unwrap();
    assert_eq!(frame.payload, close_payload(1000, "done"));
    peer.send(OpCode::Close, &close_payload(1000, "")).await;

    assert_eq!(
        events_rx.recv().await,
        Some((
            7,
            Event::PeerClose {
                code: 1000,
                reason: String::new()
            }
        ))
    );
    task.await.unwrap();
    assert_eq!(events_rx.recv().await, None);
    assert!(matches!(
        handle.send(Bytes::from_static(b"late"), false).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn dropping_handles_closes_with_going_away() {
    let (conn, mut peer) = connect(Config::default()).await;
    let (events_tx, _events_rx) = mpsc::channel(8);
    let (handle, commands_rx) = ConnectionHandle::channel(8);
    drop(handle);

    let task = tokio::spawn(conn.run(events_tx, commands_rx, |event| event));
    let frame = peer.read_frame().await.unwrap();
    assert_eq!(frame.payload, close_payload(1001, ""));

    peer.send(OpCode::Close, &close_payload(1001, "")).await;
    task.await.unwrap();
}

#[tokio::test]
async fn write_failure_reports_abnormal_close() {
    let (mut conn, mut peer) = connect(Config::default()).await;

    // The Pong for this Ping is written after the peer is gone
    peer.send(OpCode::Ping, b"x").await;
    drop(peer);

    assert_eq!(
        conn.next_event().await,
        Some(Event::PeerClose {
            code: 1006,
            reason: String::new()
        })
    );
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.next_event().await, None);
}

#[tokio::test]
async fn run_loop_reports_write_failure() {
    let config = Config::builder().channel_capacity(1).build();
    let (conn, mut peer) = connect(config).await;
    let (events_tx, mut events_rx) = mpsc::channel(8);
    let (handle, commands_rx) = conn.command_channel();

    let task = tokio::spawn(conn.run(events_tx, commands_rx, |event| event));

    peer.send(OpCode::Ping, b"x").await;
    drop(peer);

    assert_eq!(
        events_rx.recv().await,
        Some(Event::PeerClose {
            code: 1006,
            reason: String::new()
        })
    );
    task.await.unwrap();
    assert_eq!(events_rx.recv().await, None);
    assert!(handle.is_closed());
}
