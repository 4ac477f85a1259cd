mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use drover::test_helpers::{RecordingScheduler, TunnelSink};
use drover::tunnel::{encode_tunnel_frame, read_tunnel_frame};
use drover::{CoordinatorBuilder, FrameCodec, Liveness, Request, RequestBody, ResourceUpdate};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

fn local() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 15001)
}

#[tokio::test]
async fn broadcast_reaches_every_member() {
    common::init_tracing();
    let svr2 = TunnelSink::start().await.unwrap();
    let svr3 = TunnelSink::start().await.unwrap();

    let coordinator = CoordinatorBuilder::new(local())
        .with_resolver(common::loopback_resolver(&["svr2", "svr3"]))
        .add_peer("svr2", svr2.port())
        .add_peer("svr3", svr3.port())
        .build()
        .await
        .unwrap();
    assert_eq!(coordinator.membership().len(), 2);

    let report = coordinator
        .broadcast(&ResourceUpdate {
            job_id: "31.svr1".into(),
            op: 2,
            select: "2:ncpus=8:mem=4gb".into(),
            extension: Some("resv=R1".into()),
        })
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.delivered, coordinator.membership().members());

    for sink in [&svr2, &svr3] {
        let frames = sink.wait_for_frames(2, Duration::from_secs(2)).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1.body, RequestBody::Handshake);
        assert_eq!(
            frames[1].1.body,
            RequestBody::ResourceUpdate {
                job_id: "31.svr1".into(),
                op: 2,
                select: "2:ncpus=8:mem=4gb".into(),
            }
        );
        assert_eq!(frames[1].1.extension.as_deref(), Some("resv=R1"));
        // handshake and update share the member's stream
        assert_eq!(frames[0].0, frames[1].0);
    }

    coordinator.shutdown();
}

#[tokio::test]
async fn member_that_went_away_is_marked_down_on_broadcast() {
    let svr2 = TunnelSink::start().await.unwrap();
    let svr3 = TunnelSink::start().await.unwrap();
    let coordinator = CoordinatorBuilder::new(local())
        .with_resolver(common::loopback_resolver(&["svr2", "svr3"]))
        .add_peer("svr2", svr2.port())
        .add_peer("svr3", svr3.port())
        .build()
        .await
        .unwrap();
    let members = coordinator.membership().members();
    svr3.shutdown().await;

    let update = ResourceUpdate {
        job_id: "32.svr1".into(),
        op: 1,
        select: "1:ncpus=1".into(),
        extension: None,
    };
    // the first write to a reset socket may still be buffered by the kernel
    let mut report = coordinator.broadcast(&update).await.unwrap();
    if report.is_complete() {
        report = coordinator.broadcast(&update).await.unwrap();
    }

    assert_eq!(report.delivered, vec![members[0]]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, members[1]);
    assert_eq!(
        coordinator.registry().read().liveness(members[1]),
        Some(Liveness::DOWN)
    );
    // membership is append-only; the member stays listed while down
    assert_eq!(coordinator.membership().len(), 2);
}

#[tokio::test]
async fn member_goes_down_when_its_tunnel_closes() {
    let svr2 = TunnelSink::start().await.unwrap();
    let scheduler = Arc::new(RecordingScheduler::default());
    let coordinator = CoordinatorBuilder::new(local())
        .with_resolver(common::loopback_resolver(&["svr2"]))
        .with_scheduler(scheduler.clone())
        .add_peer("svr2", svr2.port())
        .build()
        .await
        .unwrap();
    let member = coordinator.membership().members()[0];

    svr2.shutdown().await;

    let registry = coordinator.registry();
    assert!(
        common::wait_for_condition(Duration::from_secs(2), || async move {
            registry.read().liveness(member) == Some(Liveness::DOWN)
        })
        .await,
        "member still up after its tunnel closed"
    );
    let seen: Vec<Liveness> = scheduler
        .transitions()
        .iter()
        .map(|transition| transition.liveness)
        .collect();
    assert_eq!(seen, vec![Liveness::UP, Liveness::DOWN]);
    assert_eq!(coordinator.membership().len(), 1);
    coordinator.shutdown();
}

#[tokio::test]
async fn inbound_frames_are_matched_to_the_member() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer_side = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (stream, _) = read_tunnel_frame(&mut socket, 1 << 20).await.unwrap();
        let reply = FrameCodec::default()
            .encode_request(&Request::new("svr2", RequestBody::Handshake))
            .unwrap();
        socket.write_all(&encode_tunnel_frame(stream, &reply)).await.unwrap();
        // keep the tunnel open until the test is done
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let coordinator = CoordinatorBuilder::new(local())
        .with_resolver(common::loopback_resolver(&["svr2"]))
        .add_peer("svr2", port)
        .build()
        .await
        .unwrap();
    let member = coordinator.membership().members()[0];

    let mut inbound = coordinator.inbound().unwrap();
    assert!(coordinator.inbound().is_none());
    let (peer, frame) = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peer, Some(member));
    assert_eq!(frame.endpoint.port(), port);
    let request = FrameCodec::default().decode_request(&frame.payload).unwrap();
    assert_eq!(request.requester, "svr2");
    assert_eq!(
        coordinator
            .membership()
            .recognize(Ipv4Addr::LOCALHOST, port),
        Some(member)
    );

    peer_side.abort();
}
