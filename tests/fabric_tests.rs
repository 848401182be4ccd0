//! Socket-role behaviour over loopback: broadcast fan-out, round-robin
//! distribution, request/reply alternation, and close semantics.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use gradegrid::fabric::{Message, Publisher, Puller, Pusher, Requester, Responder};

/// Each test takes its own port so the suites can run concurrently.
static NEXT_PORT: AtomicU16 = AtomicU16::new(47100);

fn test_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

fn addr(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

fn heartbeat(done: bool) -> Message {
    Message::Heartbeat { time: 1.0, done }
}

fn spec(key: &str) -> Message {
    Message::TestSpec {
        key: key.to_string(),
        timeout: 5,
        commands: vec!["echo hi".to_string()],
    }
}

/// Give an accept loop a beat to register a fresh connection.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_publisher_reaches_every_subscriber() {
    let port = test_port();
    let publisher = Publisher::bind(port).await.unwrap();

    let (sub_a, mut rx_a) = gradegrid::fabric::Subscriber::connect(&addr(port))
        .await
        .unwrap();
    let (sub_b, mut rx_b) = gradegrid::fabric::Subscriber::connect(&addr(port))
        .await
        .unwrap();
    settle().await;

    publisher.send(&heartbeat(false)).await.unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("subscriber should receive the broadcast")
            .expect("channel open");
        assert_eq!(received, heartbeat(false));
    }

    sub_a.close();
    sub_b.close();
    publisher.close().await;
}

#[tokio::test]
async fn test_publishing_to_nobody_succeeds() {
    let publisher = Publisher::bind(test_port()).await.unwrap();
    publisher.send(&heartbeat(true)).await.unwrap();
    publisher.close().await;
}

#[tokio::test]
async fn test_wrong_variant_frame_ends_the_subscription() {
    let port = test_port();
    let publisher = Publisher::bind(port).await.unwrap();
    let (subscriber, mut rx) = gradegrid::fabric::Subscriber::connect(&addr(port))
        .await
        .unwrap();
    settle().await;

    // A test spec does not belong on the heartbeat channel; the reader
    // must terminate rather than deliver it.
    publisher.send(&spec("alice")).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("the reader should end the channel");
    assert!(received.is_none(), "the bad frame must not be delivered");

    subscriber.close();
    publisher.close().await;
}

#[tokio::test]
async fn test_push_round_robins_over_pullers() {
    let port = test_port();
    let pusher = Pusher::bind(port).await.unwrap();

    let (pull_a, mut rx_a) = Puller::connect(&addr(port)).await.unwrap();
    let (pull_b, mut rx_b) = Puller::connect(&addr(port)).await.unwrap();
    settle().await;

    pusher.push(&spec("alice")).await.unwrap();
    pusher.push(&spec("bob")).await.unwrap();

    // Exactly one puller receives each push.
    let first = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
        .await
        .expect("first puller should get one spec")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
        .await
        .expect("second puller should get one spec")
        .unwrap();

    let mut keys: Vec<String> = [first, second]
        .into_iter()
        .map(|m| match m {
            Message::TestSpec { key, .. } => key,
            other => panic!("unexpected message {other:?}"),
        })
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["alice", "bob"]);

    pull_a.close();
    pull_b.close();
    pusher.close().await;
}

#[tokio::test]
async fn test_push_waits_for_a_puller() {
    let port = test_port();
    let pusher = Pusher::bind(port).await.unwrap();

    // Start the push with nobody connected; it must park, not fail.
    let push = tokio::spawn({
        let message = spec("alice");
        async move {
            pusher.push(&message).await.unwrap();
            pusher
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!push.is_finished(), "push should wait for a puller");

    let (puller, mut rx) = Puller::connect(&addr(port)).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("late puller should receive the parked push")
        .unwrap();
    assert_eq!(received, spec("alice"));

    puller.close();
    push.await.unwrap().close().await;
}

#[tokio::test]
async fn test_request_reply_alternation() {
    let port = test_port();
    let responder = Responder::bind(port).await.unwrap();

    let serve = tokio::spawn(async move {
        responder
            .serve(|request| match request {
                Message::FileReq { key } => Message::Files {
                    entries: vec![(format!("{key}.txt"), base64::encode(b"data"))],
                },
                _ => Message::ack(),
            })
            .await
            .unwrap();
    });

    let requester = Requester::connect(&addr(port)).await.unwrap();
    for key in ["alice", "bob", "common"] {
        let reply = requester
            .request(&Message::FileReq {
                key: key.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Message::Files {
                entries: vec![(format!("{key}.txt"), base64::encode(b"data"))],
            }
        );
    }

    // Requests the handler does not recognize still get exactly one reply.
    let reply = requester
        .request(&Message::TestCompletion {
            key: "alice".to_string(),
            results: base64::encode(b"x"),
        })
        .await
        .unwrap();
    assert_eq!(reply, Message::ack());

    requester.close().await;
    serve.abort();
}

#[tokio::test]
async fn test_request_after_close_is_a_shutdown_error() {
    let port = test_port();
    let responder = Responder::bind(port).await.unwrap();
    let serve = tokio::spawn(async move { responder.serve(|_| Message::ack()).await });

    let requester = Requester::connect(&addr(port)).await.unwrap();
    requester.close().await;
    requester.close().await; // close is idempotent

    assert!(requester
        .request(&Message::FileReq {
            key: "alice".to_string(),
        })
        .await
        .is_err());
    serve.abort();
}

#[tokio::test]
async fn test_closed_puller_ends_its_channel() {
    let port = test_port();
    let pusher = Pusher::bind(port).await.unwrap();
    let (puller, mut rx) = Puller::connect(&addr(port)).await.unwrap();
    settle().await;

    puller.close();
    puller.close(); // close is idempotent

    let end = tokio::time::timeout(Duration::from_secs(2), async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(end.is_ok(), "receiver should see the channel end");
    pusher.close().await;
}
