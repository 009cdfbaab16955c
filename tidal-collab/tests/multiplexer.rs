mod common;

use common::{alice, bob, body, insert, root, wave, LoopbackServer, RecordingTransport};
use tidal_collab::{
    ClientMessage, CloseMode, IdFilter, KnownWavelet, MultiplexerConfig, MuxError, MuxEvent,
    MuxState, OperationMultiplexer, ServerMessage, SubmitPolicy,
};
use tidal_core::{
    HashedVersion, ParticipantId, TransformedDelta, WaveletDelta, WaveletId, WaveletOperation,
};

type Mux = OperationMultiplexer<RecordingTransport>;

fn mux(participant: ParticipantId) -> Mux {
    OperationMultiplexer::new(
        wave(),
        participant,
        RecordingTransport::default(),
        MultiplexerConfig::default(),
    )
}

fn edit(at: usize, text: &str, len: usize) -> Vec<WaveletOperation> {
    vec![WaveletOperation::document(body(), insert(at, text, len))]
}

fn events(mux: &mut Mux) -> Vec<MuxEvent> {
    std::iter::from_fn(|| mux.poll_event()).collect()
}

/// Run requests through the server and feed back replies until quiet.
fn exchange(server: &mut LoopbackServer, mux: &mut Mux) {
    loop {
        let requests = mux.transport_mut().take();
        if requests.is_empty() {
            return;
        }
        for request in requests {
            let (replies, _) = server.handle(request);
            for reply in replies {
                mux.on_server_message(reply);
            }
        }
    }
}

/// A server holding `conv+root`, created by Alice with Bob in it and
/// "hello" in the body.
fn seeded_server() -> LoopbackServer {
    let mut server = LoopbackServer::new(SubmitPolicy::Transform);
    let (replies, _) = server.handle(ClientMessage::Submit {
        wave_id: wave(),
        wavelet_id: root(),
        delta: WaveletDelta {
            author: alice(),
            target_version: HashedVersion::zero(&wave(), &root()),
            ops: vec![
                WaveletOperation::AddParticipant(alice()),
                WaveletOperation::AddParticipant(bob()),
                WaveletOperation::document(body(), insert(0, "hello", 0)),
            ],
        },
    });
    assert_eq!(replies.len(), 1);
    server
}

fn opened(server: &mut LoopbackServer, participant: ParticipantId) -> Mux {
    let mut mux = mux(participant);
    mux.open(IdFilter::All).unwrap();
    exchange(server, &mut mux);
    assert_eq!(mux.state(), MuxState::Open);
    events(&mut mux);
    mux
}

fn submits(requests: &[ClientMessage]) -> usize {
    requests
        .iter()
        .filter(|r| matches!(r, ClientMessage::Submit { .. }))
        .count()
}

#[test]
fn test_open_and_reconnect_are_state_checked() {
    let mut mux = mux(alice());
    assert!(matches!(
        mux.reconnect(),
        Err(MuxError::InvalidState { operation: "reconnect", .. })
    ));
    mux.open(IdFilter::All).unwrap();
    assert_eq!(mux.state(), MuxState::Opening);
    assert!(matches!(mux.open(IdFilter::All), Err(MuxError::InvalidState { .. })));
}

#[test]
fn test_operations_wait_for_open_to_finish() {
    let mut server = seeded_server();
    let mut mux = mux(bob());
    mux.open(IdFilter::All).unwrap();

    let (replies, _) = server.handle(mux.transport_mut().take().remove(0));
    let [snapshot, finished] = <[ServerMessage; 2]>::try_from(replies).unwrap();

    mux.on_server_message(snapshot);
    assert!(matches!(events(&mut mux).as_slice(), [MuxEvent::WaveletAdded(s)] if s.wavelet_id == root()));

    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    assert!(mux.transport_mut().take().is_empty(), "nothing is sent while opening");

    mux.on_server_message(finished);
    assert_eq!(mux.state(), MuxState::Open);
    assert_eq!(events(&mut mux), vec![MuxEvent::OpenFinished]);
    assert_eq!(submits(&mux.transport_mut().take()), 1);
}

#[test]
fn test_unknown_wavelet_is_an_error() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());
    let missing = WaveletId::new("conv+missing");
    assert_eq!(
        mux.submit(&missing, edit(0, "x", 0)),
        Err(MuxError::UnknownWavelet(missing.clone()))
    );
    assert_eq!(
        mux.create_channel(root()),
        Err(MuxError::WaveletExists(root()))
    );
}

#[test]
fn test_close_with_flush_waits_for_acks() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());

    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    let submitted = mux.transport_mut().take();
    mux.close(CloseMode::Flush).unwrap();
    assert_eq!(mux.state(), MuxState::Closing);
    assert!(mux.submit(&root(), edit(0, "x", 6)).is_err());

    for request in submitted {
        let (replies, _) = server.handle(request);
        for reply in replies {
            mux.on_server_message(reply);
        }
    }

    assert_eq!(mux.state(), MuxState::Closed);
    assert!(events(&mut mux).contains(&MuxEvent::Closed));
    assert!(matches!(
        mux.transport_mut().take().as_slice(),
        [ClientMessage::Close { .. }]
    ));
    assert_eq!(server.text(&root()), "hello!");
}

#[test]
fn test_close_with_discard_reports_dropped_ops() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());

    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    mux.submit(&root(), edit(0, "?", 6)).unwrap();
    let submitted = mux.transport_mut().take();
    assert_eq!(submits(&submitted), 1);

    mux.close(CloseMode::Discard).unwrap();
    assert_eq!(mux.state(), MuxState::Closed);
    assert_eq!(
        events(&mut mux),
        vec![MuxEvent::Discarded { count: 2 }, MuxEvent::Closed]
    );

    // The ack still arrives and is ignored.
    for request in submitted {
        let (replies, _) = server.handle(request);
        for reply in replies {
            mux.on_server_message(reply);
        }
    }
    assert!(events(&mut mux).is_empty());
}

#[test]
fn test_late_messages_for_closed_wavelet_are_ignored() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());

    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    let submitted = mux.transport_mut().take();
    assert_eq!(mux.close_wavelet(&root(), CloseMode::Discard), Ok(1));
    assert!(mux.channel(&root()).is_none());

    let (replies, _) = server.handle(submitted.into_iter().next().unwrap());
    for reply in replies {
        mux.on_server_message(reply);
    }
    assert!(events(&mut mux).is_empty());
    assert!(mux.channel(&root()).is_none());
    assert_eq!(mux.state(), MuxState::Open);
}

#[test]
fn test_flushing_wavelet_close_completes_on_ack() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());

    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    assert_eq!(mux.close_wavelet(&root(), CloseMode::Flush), Ok(0));
    assert!(mux.channel(&root()).is_some());

    exchange(&mut server, &mut mux);
    assert!(mux.channel(&root()).is_none());
    assert_eq!(server.text(&root()), "hello!");
}

#[test]
fn test_failed_wavelet_is_reset_from_snapshot() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());
    let at = mux.channel(&root()).unwrap().server_version();

    let ops = edit(0, "x", 5);
    let forged = TransformedDelta {
        author: alice(),
        applied_at: at,
        resulting_version: HashedVersion {
            version: at.version + 1,
            hash: [0; 32],
        },
        timestamp: 0,
        ops,
    };
    mux.on_server_message(ServerMessage::Update {
        wave_id: wave(),
        wavelet_id: root(),
        deltas: vec![forged],
        committed: None,
    });

    let failed = events(&mut mux);
    assert!(matches!(
        failed.as_slice(),
        [MuxEvent::WaveletFailed { discarded: 0, .. }]
    ));
    assert!(mux.channel(&root()).is_none());
    assert!(matches!(
        mux.transport().sent.as_slice(),
        [ClientMessage::RequestSnapshot { .. }]
    ));

    exchange(&mut server, &mut mux);
    match events(&mut mux).as_slice() {
        [MuxEvent::WaveletReset { snapshot, discarded: 0 }] => {
            assert_eq!(snapshot.version, at)
        }
        other => panic!("expected a reset, got {other:?}"),
    }
    assert_eq!(mux.channel(&root()).unwrap().server_version(), at);
}

#[test]
fn test_permanent_rejection_fails_the_wavelet() {
    let mut server = seeded_server();
    let carol = ParticipantId::new("carol@example.com").unwrap();
    let mut mux = opened(&mut server, carol);

    // Carol is not a participant.
    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    let submitted = mux.transport_mut().take();
    for request in submitted {
        let (replies, _) = server.handle(request);
        for reply in replies {
            mux.on_server_message(reply);
        }
    }

    let failed = events(&mut mux);
    assert!(matches!(
        failed.as_slice(),
        [MuxEvent::WaveletFailed { discarded: 1, .. }]
    ));
    assert_eq!(server.text(&root()), "hello");
}

#[test]
fn test_created_wavelet_collides_with_existing_one() {
    let mut server = LoopbackServer::new(SubmitPolicy::Transform);
    let mut first = opened(&mut server, bob());
    let mut second = opened(&mut server, alice());
    let shared = WaveletId::new("w+shared");

    first.create_channel(shared.clone()).unwrap();
    first
        .submit(
            &shared,
            vec![
                WaveletOperation::AddParticipant(bob()),
                WaveletOperation::AddParticipant(alice()),
                WaveletOperation::document(body(), insert(0, "bob", 0)),
            ],
        )
        .unwrap();
    second.create_channel(shared.clone()).unwrap();
    second.submit(&shared, edit(0, "alice", 0)).unwrap();

    // Bob's creation reaches the server first; Alice hears about it
    // before her own ack.
    let (replies, announcement) = server.handle(first.transport_mut().take().remove(0));
    for reply in replies {
        first.on_server_message(reply);
    }
    let (replies, _) = server.handle(second.transport_mut().take().remove(0));
    second.on_server_message(announcement.unwrap());
    for reply in replies {
        second.on_server_message(reply);
    }

    assert!(events(&mut second).contains(&MuxEvent::OperationsReceived(shared.clone())));
    let received: Vec<WaveletOperation> =
        std::iter::from_fn(|| second.receive(&shared)).map(|r| r.op).collect();
    assert!(received.contains(&WaveletOperation::AddParticipant(bob())));

    let channel = second.channel(&shared).unwrap();
    assert!(channel.is_idle());
    assert!(!channel.is_expecting_snapshot());
    assert_eq!(
        channel.server_version(),
        server.container(&shared).unwrap().version()
    );
    assert_eq!(server.text(&shared), "bobalice");
}

#[test]
fn test_reconnect_sends_known_versions_and_resends() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());
    let known = mux.channel(&root()).unwrap().server_version();

    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    let lost = mux.transport_mut().take();
    assert_eq!(submits(&lost), 1);

    mux.on_disconnected();
    assert_eq!(mux.state(), MuxState::Unopened);
    assert_eq!(events(&mut mux), vec![MuxEvent::Disconnected]);

    mux.reconnect().unwrap();
    match mux.transport().sent.as_slice() {
        [ClientMessage::Open { known: wavelets, .. }] => assert_eq!(
            wavelets,
            &vec![KnownWavelet {
                wavelet_id: root(),
                version: known,
            }]
        ),
        other => panic!("expected an open, got {other:?}"),
    }

    exchange(&mut server, &mut mux);
    assert_eq!(mux.state(), MuxState::Open);
    assert!(mux.is_idle());
    assert_eq!(server.text(&root()), "hello!");
}

#[test]
fn test_transport_failure_disconnects() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());

    mux.transport_mut().offline = true;
    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    assert_eq!(mux.state(), MuxState::Unopened);
    assert_eq!(events(&mut mux), vec![MuxEvent::Disconnected]);
    assert!(!mux.is_idle());

    mux.transport_mut().offline = false;
    mux.reconnect().unwrap();
    exchange(&mut server, &mut mux);
    assert!(mux.is_idle());
    assert_eq!(server.text(&root()), "hello!");
}

#[test]
fn test_flush_close_while_opening_completes_after_open() {
    let mut server = seeded_server();
    let mut mux = mux(bob());
    mux.open(IdFilter::All).unwrap();

    let (replies, _) = server.handle(mux.transport_mut().take().remove(0));
    let [snapshot, finished] = <[ServerMessage; 2]>::try_from(replies).unwrap();
    mux.on_server_message(snapshot);
    mux.submit(&root(), edit(5, "!", 5)).unwrap();

    mux.close(CloseMode::Flush).unwrap();
    assert_eq!(mux.state(), MuxState::Closing);
    assert!(mux.transport_mut().take().is_empty());

    mux.on_server_message(finished);
    assert_eq!(mux.state(), MuxState::Closing);
    exchange(&mut server, &mut mux);

    assert_eq!(mux.state(), MuxState::Closed);
    assert_eq!(server.text(&root()), "hello!");
    let seen = events(&mut mux);
    assert!(matches!(seen.first(), Some(MuxEvent::WaveletAdded(_))));
    assert!(seen.contains(&MuxEvent::OpenFinished));
    assert_eq!(seen.last(), Some(&MuxEvent::Closed));
    assert!(!seen.iter().any(|e| matches!(e, MuxEvent::Discarded { .. })));
}

#[test]
fn test_flush_close_without_connection_discards() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());

    mux.transport_mut().offline = true;
    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    assert_eq!(mux.state(), MuxState::Unopened);
    events(&mut mux);

    mux.close(CloseMode::Flush).unwrap();
    assert_eq!(mux.state(), MuxState::Closed);
    assert_eq!(
        events(&mut mux),
        vec![MuxEvent::Discarded { count: 1 }, MuxEvent::Closed]
    );
}

#[test]
fn test_full_queue_holds_the_delta_for_the_next_flush() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());

    mux.transport_mut().full = true;
    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    assert_eq!(mux.state(), MuxState::Open);
    assert!(events(&mut mux).is_empty());
    assert!(mux.transport().sent.is_empty());
    assert!(!mux.is_idle());

    mux.transport_mut().full = false;
    mux.flush();
    assert_eq!(submits(&mux.transport_mut().sent), 1);
    exchange(&mut server, &mut mux);
    assert!(mux.is_idle());
    assert_eq!(server.text(&root()), "hello!");
}

#[test]
fn test_full_queue_defers_the_resync_request() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());
    let at = mux.channel(&root()).unwrap().server_version();

    mux.transport_mut().full = true;
    mux.on_server_message(ServerMessage::Update {
        wave_id: wave(),
        wavelet_id: root(),
        deltas: vec![TransformedDelta {
            author: alice(),
            applied_at: at,
            resulting_version: HashedVersion {
                version: at.version + 1,
                hash: [0; 32],
            },
            timestamp: 0,
            ops: edit(0, "x", 5),
        }],
        committed: None,
    });
    assert!(matches!(
        events(&mut mux).as_slice(),
        [MuxEvent::WaveletFailed { .. }]
    ));
    assert_eq!(mux.state(), MuxState::Open);
    assert!(mux.transport().sent.is_empty());

    mux.transport_mut().full = false;
    mux.flush();
    assert!(matches!(
        mux.transport().sent.as_slice(),
        [ClientMessage::RequestSnapshot { .. }]
    ));
    exchange(&mut server, &mut mux);
    assert!(matches!(
        events(&mut mux).as_slice(),
        [MuxEvent::WaveletReset { .. }]
    ));
    assert!(mux.channel(&root()).is_some());
}

/// Apply one operation by Alice and return what other connections see.
fn announce(server: &mut LoopbackServer, op: WaveletOperation) -> ServerMessage {
    let target = server.container(&root()).unwrap().version();
    let (_, announcement) = server.handle(ClientMessage::Submit {
        wave_id: wave(),
        wavelet_id: root(),
        delta: WaveletDelta {
            author: alice(),
            target_version: target,
            ops: vec![op],
        },
    });
    announcement.unwrap()
}

#[test]
fn test_readded_participant_gets_the_wavelet_back() {
    let mut server = seeded_server();
    let mut mux = opened(&mut server, bob());

    let removal = announce(&mut server, WaveletOperation::RemoveParticipant(bob()));
    mux.on_server_message(removal);
    events(&mut mux);
    mux.close_wavelet(&root(), CloseMode::Discard).unwrap();
    assert!(mux.create_channel(root()).is_err());

    let readd = announce(&mut server, WaveletOperation::AddParticipant(bob()));
    mux.on_server_message(readd);
    assert!(matches!(
        mux.transport().sent.as_slice(),
        [ClientMessage::RequestSnapshot { .. }]
    ));
    exchange(&mut server, &mut mux);

    match events(&mut mux).as_slice() {
        [MuxEvent::WaveletAdded(snapshot)] => {
            assert!(snapshot.participants.contains(&bob()));
            assert_eq!(snapshot.version, server.container(&root()).unwrap().version());
        }
        other => panic!("expected the wavelet back, got {other:?}"),
    }
    mux.submit(&root(), edit(5, "!", 5)).unwrap();
    exchange(&mut server, &mut mux);
    assert_eq!(server.text(&root()), "hello!");
}
