mod support;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use huddle::messages::{AbortReason, ControlMessage, ErrorKind};
use support::{create_meeting, join_meeting, start_server, start_server_with, TestClient};

fn chunk_payload(fill: u8) -> String {
    BASE64.encode(vec![fill; 8192])
}

async fn expect_chunk(client: &mut TestClient, want_seq: u32) -> String {
    match client.recv().await {
        ControlMessage::FileChunkForward { seq, data, .. } => {
            assert_eq!(seq, want_seq);
            data
        }
        other => panic!("expected FILE_CHUNK_FORWARD, got {other:?}"),
    }
}

async fn expect_ack_forward(client: &mut TestClient, want_seq: u32) {
    match client.recv().await {
        ControlMessage::FileAckForward { seq, .. } => assert_eq!(seq, want_seq),
        other => panic!("expected FILE_ACK_FORWARD, got {other:?}"),
    }
}

/// Full transfer with one lost ack: the window paces the chunks, the
/// retransmit collapses it, and completion is deferred until the last ack.
#[tokio::test]
async fn transfer_with_a_single_timeout() {
    let mut cfg = support::local_config();
    // A short ack timeout keeps the retransmit wait reasonable in-test; the
    // window arithmetic is identical to the 2 s default.
    cfg.ack_timeout_ms = 500;
    let (tcp, _udp) = start_server_with(cfg).await;

    let (mut a, code) = create_meeting(tcp, "Alice").await;
    let (mut b, b_id) = join_meeting(tcp, &mut a, &code, "Bob").await;

    a.send(&ControlMessage::FileStart {
        transfer_id: 7,
        to: Some(b_id),
        name: "x.bin".into(),
        size: 24576,
    })
    .await;
    match b.recv().await {
        ControlMessage::FileStartForward {
            transfer_id,
            from,
            name,
            size,
        } => {
            assert_eq!(transfer_id, 7);
            assert_eq!(from, 1);
            assert_eq!(name, "x.bin");
            assert_eq!(size, 24576);
        }
        other => panic!("expected FILE_START_FORWARD, got {other:?}"),
    }

    for seq in 0..3u32 {
        a.send(&ControlMessage::FileChunk {
            transfer_id: 7,
            seq,
            data: chunk_payload(seq as u8),
        })
        .await;
    }

    // cwnd starts at 1: only chunk 0 arrives.
    let data0 = expect_chunk(&mut b, 0).await;
    assert_eq!(data0, chunk_payload(0));
    b.expect_silence().await;

    // Ack 0: slow start doubles the window and both queued chunks flush.
    b.send(&ControlMessage::FileAck {
        transfer_id: 7,
        seq: 0,
    })
    .await;
    expect_ack_forward(&mut a, 0).await;
    expect_chunk(&mut b, 1).await;
    expect_chunk(&mut b, 2).await;

    b.send(&ControlMessage::FileAck {
        transfer_id: 7,
        seq: 1,
    })
    .await;
    expect_ack_forward(&mut a, 1).await;

    // Withhold the ack for chunk 2: the sweep retransmits it.
    let retransmitted = expect_chunk(&mut b, 2).await;
    assert_eq!(retransmitted, chunk_payload(2));

    b.send(&ControlMessage::FileAck {
        transfer_id: 7,
        seq: 2,
    })
    .await;
    expect_ack_forward(&mut a, 2).await;

    a.send(&ControlMessage::FileEnd { transfer_id: 7 }).await;
    assert!(matches!(
        b.recv().await,
        ControlMessage::FileEndForward { transfer_id: 7 }
    ));

    // Session is freed: a further ack is a state error.
    b.send(&ControlMessage::FileAck {
        transfer_id: 7,
        seq: 2,
    })
    .await;
    match b.recv().await {
        ControlMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::State),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn broadcast_transfer_reaches_every_member() {
    let (tcp, _udp) = start_server().await;
    let (mut a, code) = create_meeting(tcp, "Alice").await;
    let (mut b, _b_id) = join_meeting(tcp, &mut a, &code, "Bob").await;
    let (mut c, c_id) = join_meeting(tcp, &mut a, &code, "Cleo").await;
    match b.recv().await {
        ControlMessage::MemberJoined { participant_id, .. } => assert_eq!(participant_id, c_id),
        other => panic!("expected MEMBER_JOINED, got {other:?}"),
    }

    a.send(&ControlMessage::FileStart {
        transfer_id: 3,
        to: None,
        name: "notes.txt".into(),
        size: 8192,
    })
    .await;
    for client in [&mut b, &mut c] {
        assert!(matches!(
            client.recv().await,
            ControlMessage::FileStartForward { transfer_id: 3, .. }
        ));
    }

    a.send(&ControlMessage::FileChunk {
        transfer_id: 3,
        seq: 0,
        data: chunk_payload(0xCC),
    })
    .await;
    for client in [&mut b, &mut c] {
        expect_chunk(client, 0).await;
    }

    // First ack credits the chunk; the duplicate from the other member is
    // dropped, so the sender sees exactly one FILE_ACK_FORWARD.
    b.send(&ControlMessage::FileAck {
        transfer_id: 3,
        seq: 0,
    })
    .await;
    c.send(&ControlMessage::FileAck {
        transfer_id: 3,
        seq: 0,
    })
    .await;
    expect_ack_forward(&mut a, 0).await;

    a.send(&ControlMessage::FileEnd { transfer_id: 3 }).await;
    for client in [&mut b, &mut c] {
        assert!(matches!(
            client.recv().await,
            ControlMessage::FileEndForward { transfer_id: 3 }
        ));
    }
    a.expect_silence().await;
}

#[tokio::test]
async fn out_of_order_chunk_aborts_session_and_connection() {
    let (tcp, _udp) = start_server().await;
    let (mut a, code) = create_meeting(tcp, "Alice").await;
    let (mut b, b_id) = join_meeting(tcp, &mut a, &code, "Bob").await;

    a.send(&ControlMessage::FileStart {
        transfer_id: 9,
        to: Some(b_id),
        name: "x.bin".into(),
        size: 16384,
    })
    .await;
    b.recv().await; // FILE_START_FORWARD

    a.send(&ControlMessage::FileChunk {
        transfer_id: 9,
        seq: 5,
        data: chunk_payload(0),
    })
    .await;

    // Both ends see the abort; the offending connection also gets a
    // protocol error and is closed.
    assert!(matches!(
        b.recv().await,
        ControlMessage::FileAbort {
            transfer_id: 9,
            reason: AbortReason::Protocol,
        }
    ));
    let mut saw_abort = false;
    let mut saw_protocol_error = false;
    while let Some(msg) = a.try_recv(Duration::from_secs(2)).await {
        match msg {
            ControlMessage::FileAbort {
                reason: AbortReason::Protocol,
                ..
            } => saw_abort = true,
            ControlMessage::Error { kind, .. } => {
                assert_eq!(kind, ErrorKind::Protocol);
                saw_protocol_error = true;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(saw_abort);
    assert!(saw_protocol_error);
    assert!(a.closed(Duration::from_secs(2)).await);

    // B stays in the meeting.
    b.send(&ControlMessage::Heartbeat).await;
    assert!(matches!(b.recv().await, ControlMessage::HeartbeatAck));
}

#[tokio::test]
async fn retry_exhaustion_aborts_with_timeout_reason() {
    let mut cfg = support::local_config();
    cfg.ack_timeout_ms = 150;
    cfg.max_retries = 2;
    let (tcp, _udp) = start_server_with(cfg).await;

    let (mut a, code) = create_meeting(tcp, "Alice").await;
    let (mut b, b_id) = join_meeting(tcp, &mut a, &code, "Bob").await;

    a.send(&ControlMessage::FileStart {
        transfer_id: 4,
        to: Some(b_id),
        name: "x.bin".into(),
        size: 8192,
    })
    .await;
    b.recv().await; // FILE_START_FORWARD
    a.send(&ControlMessage::FileChunk {
        transfer_id: 4,
        seq: 0,
        data: chunk_payload(1),
    })
    .await;

    // Never ack: the chunk is retransmitted max_retries times, then the
    // session dies on both ends.
    let mut aborted = false;
    while let Some(msg) = b.try_recv(Duration::from_secs(5)).await {
        match msg {
            ControlMessage::FileChunkForward { seq: 0, .. } => {}
            ControlMessage::FileAbort {
                transfer_id: 4,
                reason: AbortReason::Timeout,
            } => {
                aborted = true;
                break;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(aborted);
    let mut sender_aborted = false;
    while let Some(msg) = a.try_recv(Duration::from_secs(2)).await {
        if matches!(
            msg,
            ControlMessage::FileAbort {
                transfer_id: 4,
                reason: AbortReason::Timeout,
            }
        ) {
            sender_aborted = true;
            break;
        }
    }
    assert!(sender_aborted);
}

#[tokio::test]
async fn departing_member_aborts_its_transfers() {
    let (tcp, _udp) = start_server().await;
    let (mut a, code) = create_meeting(tcp, "Alice").await;
    let (mut b, b_id) = join_meeting(tcp, &mut a, &code, "Bob").await;

    a.send(&ControlMessage::FileStart {
        transfer_id: 11,
        to: Some(b_id),
        name: "x.bin".into(),
        size: 8192,
    })
    .await;
    b.recv().await; // FILE_START_FORWARD

    b.send(&ControlMessage::Leave).await;

    let mut saw_abort = false;
    while let Some(msg) = a.try_recv(Duration::from_secs(2)).await {
        match msg {
            ControlMessage::FileAbort {
                transfer_id: 11,
                reason: AbortReason::Departed,
            } => {
                saw_abort = true;
                break;
            }
            ControlMessage::MemberLeft { .. } => {}
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(saw_abort);
}

#[tokio::test]
async fn file_start_outside_a_meeting_is_a_state_error() {
    let (tcp, _udp) = start_server().await;
    let mut client = TestClient::connect(tcp).await;
    client
        .send(&ControlMessage::FileStart {
            transfer_id: 1,
            to: None,
            name: "x.bin".into(),
            size: 8192,
        })
        .await;
    match client.recv().await {
        ControlMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::State),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn lone_host_has_no_transfer_targets() {
    let (tcp, _udp) = start_server().await;
    let (mut a, _code) = create_meeting(tcp, "Alice").await;
    a.send(&ControlMessage::FileStart {
        transfer_id: 2,
        to: None,
        name: "x.bin".into(),
        size: 8192,
    })
    .await;
    match a.recv().await {
        ControlMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::State),
        other => panic!("expected ERROR, got {other:?}"),
    }
}
