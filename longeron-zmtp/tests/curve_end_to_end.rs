//! CURVE engines driven end to end, including ZAP authentication.

mod common;

use bytes::Bytes;
use common::*;
use longeron_core::error::ErrorReason;
use longeron_core::metadata;
use longeron_core::msg::Msg;
use longeron_zmtp::mechanism::CurveKeyPair;
use longeron_zmtp::{Options, SocketType};

struct CurvePair {
    client: Peer<DuplexTransport>,
    server: Peer<DuplexTransport>,
}

fn curve_pair(server_zap: ZapMode) -> CurvePair {
    init_tracing();
    let server_keys = CurveKeyPair::generate();
    let client_keys = CurveKeyPair::generate();

    let (tc, ts) = duplex_pair();
    let client = Peer::new(
        tc,
        Options::new(SocketType::Req)
            .with_mechanism(longeron_zmtp::MechanismKind::Curve)
            .with_curve_client_keys(
                client_keys.secret.to_bytes(),
                *client_keys.public.as_bytes(),
                *server_keys.public.as_bytes(),
            ),
    );
    let server = Peer::with_session(
        ts,
        Options::new(SocketType::Rep)
            .with_mechanism(longeron_zmtp::MechanismKind::Curve)
            .with_curve_server_keys(
                server_keys.secret.to_bytes(),
                *server_keys.public.as_bytes(),
            )
            .with_zap_domain("global"),
        FakeSession::with_zap(server_zap),
    );
    CurvePair { client, server }
}

#[test]
fn curve_handshake_with_synchronous_zap_accept() {
    let CurvePair {
        mut client,
        mut server,
    } = curve_pair(ZapMode::AutoReply(b"200"));

    client.plug();
    server.plug();
    pump_pair(&mut client, &mut server);

    assert!(!client.engine.handshaking());
    assert!(!server.engine.handshaking());
    assert!(client.session.events.contains(&TestEvent::Handshaken(3)));
    assert!(server.session.events.contains(&TestEvent::Handshaken(3)));

    // The authenticator saw exactly one request carrying the client's
    // long-term key as its credential.
    assert_eq!(server.session.zap_requests[6].data().as_ref(), b"CURVE");
    assert_eq!(server.session.zap_requests[7].data().len(), 32);
}

#[test]
fn messages_round_trip_encrypted_with_flags() {
    let CurvePair {
        mut client,
        mut server,
    } = curve_pair(ZapMode::AutoReply(b"200"));
    client.plug();
    server.plug();
    pump_pair(&mut client, &mut server);

    client.send(Msg::new(Bytes::from_static(b"question")).with_more(true));
    client.send(Msg::new(Bytes::from_static(b"tail")));
    pump_pair(&mut client, &mut server);

    // Credential frame first, then the data in order with flags intact.
    assert!(server.session.pushed[0].is_credential());
    assert_eq!(server.session.pushed[0].data().as_ref(), b"test-user");
    assert_eq!(server.session.pushed[1].data().as_ref(), b"question");
    assert!(server.session.pushed[1].has_more());
    assert_eq!(server.session.pushed[2].data().as_ref(), b"tail");
    assert!(!server.session.pushed[2].has_more());

    server.send(Msg::new(Bytes::from_static(b"answer")));
    pump_pair(&mut client, &mut server);
    assert_eq!(client.session.pushed_payloads(), vec![b"answer".as_ref()]);

    // Nothing readable on the wire resembles the payloads.
    assert!(server.session.errors.is_empty());
    assert!(client.session.errors.is_empty());
}

#[test]
fn inbound_metadata_carries_user_id_and_peer_address() {
    let CurvePair {
        mut client,
        mut server,
    } = curve_pair(ZapMode::AutoReply(b"200"));
    client.plug();
    server.plug();
    pump_pair(&mut client, &mut server);

    client.send(Msg::new(Bytes::from_static(b"m")));
    pump_pair(&mut client, &mut server);

    let data_msg = server
        .session
        .pushed
        .iter()
        .find(|m| !m.is_credential())
        .expect("data delivered");
    let meta = data_msg.metadata().expect("metadata attached");
    assert_eq!(meta.get(metadata::USER_ID).unwrap().as_ref(), b"test-user");
    assert_eq!(meta.get(metadata::SOCKET_TYPE).unwrap().as_ref(), b"REQ");
    assert!(meta.get(metadata::PEER_ADDRESS).is_some());
}

#[test]
fn deferred_zap_reply_pauses_input_then_completes() {
    let CurvePair {
        mut client,
        mut server,
    } = curve_pair(ZapMode::Deferred);
    client.plug();
    server.plug();
    pump_pair(&mut client, &mut server);

    // INITIATE processed, request sent, reply pending: the engine stalls
    // inbound traffic while keeping the handshake state.
    assert!(server.engine.handshaking());
    assert!(server.engine.input_stopped());
    assert!(!server.poller.poll_in);
    assert!(client.engine.handshaking());

    server.session.deliver_zap_reply(b"200");
    server.zap_msg_available();
    pump_pair(&mut client, &mut server);

    assert!(!server.engine.handshaking());
    assert!(!client.engine.handshaking());
    assert!(!server.engine.input_stopped());
    assert!(server.poller.poll_in);
}

#[test]
fn zap_denial_sends_error_and_fails_both_ends() {
    let CurvePair {
        mut client,
        mut server,
    } = curve_pair(ZapMode::AutoReply(b"400"));
    client.plug();
    server.plug();
    pump_pair(&mut client, &mut server);

    assert!(server.engine.terminated());
    assert_eq!(server.session.errors, vec![(false, ErrorReason::Protocol)]);

    assert!(client.engine.terminated());
    assert_eq!(client.session.errors, vec![(false, ErrorReason::Protocol)]);
    assert!(client
        .session
        .events
        .iter()
        .any(|e| matches!(e, TestEvent::HandshakeFailed(s) if s.contains("400"))));
}

#[test]
fn corrupt_hello_gets_bare_error_then_protocol_failure() {
    let server_keys = CurveKeyPair::generate();
    let (transport, wire) = scripted();

    // Client-side v3 greeting proposing CURVE.
    let mut greeting = [0u8; 64];
    greeting[0] = 0xFF;
    greeting[8] = 1;
    greeting[9] = 0x7F;
    greeting[10] = 3;
    greeting[12..17].copy_from_slice(b"CURVE");
    wire.feed(&greeting);

    // A size-correct HELLO whose box cannot open.
    let mut hello = Vec::with_capacity(200);
    hello.extend_from_slice(b"\x05HELLO");
    hello.extend_from_slice(&[1, 0]);
    hello.extend_from_slice(&[0u8; 72]);
    hello.extend_from_slice(&[7u8; 32]); // alleged client ephemeral key
    hello.extend_from_slice(&1u64.to_be_bytes());
    hello.extend_from_slice(&[0xAAu8; 80]); // garbage box
    wire.feed(&[0x04, 200]); // v2 command frame header
    wire.feed(&hello);

    let mut server = Peer::new(
        transport,
        Options::new(SocketType::Rep)
            .with_mechanism(longeron_zmtp::MechanismKind::Curve)
            .with_curve_server_keys(
                server_keys.secret.to_bytes(),
                *server_keys.public.as_bytes(),
            ),
    );
    server.plug();
    server.pump();

    assert!(server.engine.terminated());
    assert_eq!(server.session.errors, vec![(false, ErrorReason::Protocol)]);

    // The wire saw our greeting followed by the framed ERROR command with
    // an empty status code: flags 0x04, length 7, `\x05ERROR\x00`.
    let written = wire.written();
    assert_eq!(written.len(), 64 + 9);
    assert_eq!(hex::encode(&written[64..]), "0407054552524f5200");
}
