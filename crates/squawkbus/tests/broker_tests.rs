use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use squawkbus_broker::{Server, ServerConfig};
use squawkbus_client::{Client, Credentials};
use squawkbus_protocol::v1::{DataPacket, Message, SubscriptionRequest};

fn local_config() -> ServerConfig {
    ServerConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    }
}

async fn start_broker(config: ServerConfig) -> anyhow::Result<(SocketAddr, CancellationToken)> {
    let server = Server::bind(config).await?;
    let addr = server.local_addr()?;
    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.serve(serve_shutdown).await;
    });
    Ok((addr, shutdown))
}

async fn recv_within(client: &mut Client, ms: u64) -> Option<Message> {
    tokio::time::timeout(Duration::from_millis(ms), client.recv())
        .await
        .ok()
        .flatten()
}

async fn expect_message(client: &mut Client) -> anyhow::Result<Message> {
    recv_within(client, 2000).await.context("expected a message")
}

#[tokio::test]
async fn anonymous_clients_exchange_public_publishes() -> anyhow::Result<()> {
    let (addr, _shutdown) = start_broker(local_config()).await?;

    let mut subscriber = Client::connect(addr, Credentials::none()).await?;
    let mut publisher = Client::connect(addr, Credentials::none()).await?;

    // The publisher listens for the topic so it knows when the subscription
    // has landed.
    publisher.listen("any\\.topic\\.at\\.all").await?;
    subscriber.subscribe("any.topic.at.all").await?;
    let notified = expect_message(&mut publisher).await?;
    let Message::ForwardedSubscriptionRequest(n) = notified else {
        anyhow::bail!("expected a subscription notification, got {notified:?}");
    };
    assert!(n.is_add);
    assert_eq!(n.user, "nobody");
    assert_eq!(n.client_id, subscriber.local_addr().to_string());

    publisher
        .publish(
            "any.topic.at.all",
            vec![DataPacket::new(0, "text/plain", b"hi".to_vec())],
        )
        .await?;

    let Message::ForwardedMulticastData(m) = expect_message(&mut subscriber).await? else {
        anyhow::bail!("expected forwarded multicast data");
    };
    assert_eq!(m.user, "nobody");
    assert_eq!(m.host, "127.0.0.1");
    assert_eq!(m.feed, "");
    assert_eq!(m.topic, "any.topic.at.all");
    assert_eq!(m.content_type, "");
    assert_eq!(
        m.data_packets,
        vec![DataPacket::new(0, "text/plain", b"hi".to_vec())]
    );
    Ok(())
}

#[tokio::test]
async fn entitlements_filter_what_each_subscriber_sees() -> anyhow::Result<()> {
    let mut config = local_config();
    config.authorization_specs = vec![
        "alice:prices:1:Subscriber".parse().unwrap(),
        "bob:prices:1,2:Publisher|Notifier".parse().unwrap(),
    ];
    let (addr, _shutdown) = start_broker(config).await?;

    let mut alice = Client::connect(addr, Credentials::plain("alice")).await?;
    let mut bob = Client::connect(addr, Credentials::plain("bob")).await?;

    bob.listen("prices").await?;
    alice.subscribe("prices").await?;
    expect_message(&mut bob).await?;

    bob.publish(
        "prices",
        vec![
            DataPacket::new(1, "", b"p1".to_vec()),
            DataPacket::new(2, "", b"p2".to_vec()),
        ],
    )
    .await?;

    let Message::ForwardedMulticastData(m) = expect_message(&mut alice).await? else {
        anyhow::bail!("expected forwarded multicast data");
    };
    assert_eq!(m.user, "bob");
    assert_eq!(m.data_packets, vec![DataPacket::new(1, "", b"p1".to_vec())]);

    // Nothing else arrives for the filtered packet.
    assert!(recv_within(&mut alice, 100).await.is_none());
    Ok(())
}

#[tokio::test]
async fn listeners_follow_subscription_lifecycles() -> anyhow::Result<()> {
    let (addr, _shutdown) = start_broker(local_config()).await?;

    let mut listener = Client::connect(addr, Credentials::none()).await?;
    let subscriber = Client::connect(addr, Credentials::none()).await?;
    let subscriber_id = subscriber.local_addr().to_string();

    listener.listen(".*stocks.*").await?;
    subscriber.subscribe("eu.stocks.de").await?;

    let Message::ForwardedSubscriptionRequest(m) = expect_message(&mut listener).await? else {
        anyhow::bail!("expected forwarded subscription request");
    };
    assert_eq!(m.user, "nobody");
    assert_eq!(m.host, "127.0.0.1");
    assert_eq!(m.client_id, subscriber_id);
    assert_eq!(m.topic, "eu.stocks.de");
    assert!(m.is_add);

    // Dropping the subscriber closes its connection; the listener hears the
    // implicit unsubscribe.
    drop(subscriber);

    let Message::ForwardedSubscriptionRequest(m) = expect_message(&mut listener).await? else {
        anyhow::bail!("expected forwarded subscription request");
    };
    assert_eq!(m.client_id, subscriber_id);
    assert_eq!(m.topic, "eu.stocks.de");
    assert!(!m.is_add);
    Ok(())
}

#[tokio::test]
async fn a_late_listener_receives_the_current_image() -> anyhow::Result<()> {
    let (addr, _shutdown) = start_broker(local_config()).await?;

    let mut early = Client::connect(addr, Credentials::none()).await?;
    let subscriber = Client::connect(addr, Credentials::none()).await?;

    early.listen("eu\\..*").await?;
    subscriber.subscribe("eu.stocks.de").await?;
    expect_message(&mut early).await?;

    // A listener arriving after the subscribe still learns about it.
    let mut late = Client::connect(addr, Credentials::none()).await?;
    late.listen(".*stocks.*").await?;

    let Message::ForwardedSubscriptionRequest(m) = expect_message(&mut late).await? else {
        anyhow::bail!("expected forwarded subscription request");
    };
    assert_eq!(m.topic, "eu.stocks.de");
    assert!(m.is_add);
    Ok(())
}

#[tokio::test]
async fn n_subscribes_need_n_unsubscribes_end_to_end() -> anyhow::Result<()> {
    let (addr, _shutdown) = start_broker(local_config()).await?;

    let mut watcher = Client::connect(addr, Credentials::none()).await?;
    let mut subscriber = Client::connect(addr, Credentials::none()).await?;
    let publisher = Client::connect(addr, Credentials::none()).await?;

    watcher.listen("counted").await?;
    // Let the listener registration land before the counted subscribes start.
    tokio::time::sleep(Duration::from_millis(100)).await;

    subscriber.subscribe("counted").await?;
    subscriber.subscribe("counted").await?;
    subscriber.unsubscribe("counted").await?;

    // Three counted changes, three notifications.
    for expected_add in [true, true, false] {
        let Message::ForwardedSubscriptionRequest(m) = expect_message(&mut watcher).await? else {
            anyhow::bail!("expected forwarded subscription request");
        };
        assert_eq!(m.is_add, expected_add);
    }

    // Still subscribed: a publish is delivered.
    publisher
        .publish("counted", vec![DataPacket::new(0, "", b"one".to_vec())])
        .await?;
    assert!(matches!(
        expect_message(&mut subscriber).await?,
        Message::ForwardedMulticastData(_)
    ));

    // The final unsubscribe clears the topic.
    subscriber.unsubscribe("counted").await?;
    expect_message(&mut watcher).await?;
    publisher
        .publish("counted", vec![DataPacket::new(0, "", b"two".to_vec())])
        .await?;
    assert!(recv_within(&mut subscriber, 100).await.is_none());
    Ok(())
}

#[tokio::test]
async fn unicast_routes_by_client_id() -> anyhow::Result<()> {
    let (addr, _shutdown) = start_broker(local_config()).await?;

    let mut target = Client::connect(addr, Credentials::none()).await?;
    let mut sender = Client::connect(addr, Credentials::none()).await?;

    // Confirm the target's registration has landed before addressing it.
    sender.listen("direct").await?;
    target.subscribe("direct").await?;
    expect_message(&mut sender).await?;

    sender
        .send_to(
            target.local_addr().to_string(),
            "direct",
            vec![DataPacket::new(0, "", b"psst".to_vec())],
        )
        .await?;

    let Message::ForwardedUnicastData(m) = expect_message(&mut target).await? else {
        anyhow::bail!("expected forwarded unicast data");
    };
    assert_eq!(m.client_id, sender.local_addr().to_string());
    assert_eq!(m.topic, "direct");
    assert_eq!(m.data_packets, vec![DataPacket::new(0, "", b"psst".to_vec())]);

    // An unknown client id is dropped without closing the sender.
    sender
        .send_to("203.0.113.9:1", "direct", vec![DataPacket::new(0, "", b"x".to_vec())])
        .await?;
    sender
        .send_to(
            target.local_addr().to_string(),
            "direct",
            vec![DataPacket::new(0, "", b"again".to_vec())],
        )
        .await?;
    assert!(matches!(
        expect_message(&mut target).await?,
        Message::ForwardedUnicastData(_)
    ));
    Ok(())
}

#[tokio::test]
async fn unauthenticated_requests_close_the_connection() -> anyhow::Result<()> {
    let (addr, _shutdown) = start_broker(local_config()).await?;

    let mut stream = TcpStream::connect(addr).await?;
    let body = Message::SubscriptionRequest(SubscriptionRequest {
        topic: "x".into(),
        is_add: true,
    })
    .to_frame()
    .into_vec();
    let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(&body);
    stream.write_all(&bytes).await?;

    // The broker answers with a bare FIN: no bytes, then EOF.
    let mut buf = [0u8; 16];
    let closed = match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
        Ok(Ok(0)) => true,
        Ok(Ok(_)) => false,
        Ok(Err(_)) => true, // reset also counts as closed
        Err(_) => false,
    };
    assert!(closed, "connection should have been closed");
    Ok(())
}

#[tokio::test]
async fn bad_credentials_close_the_connection() -> anyhow::Result<()> {
    let passwd_path = std::env::temp_dir().join(format!(
        "squawkbus-test-{}-bad-credentials.passwd",
        std::process::id()
    ));
    // "password" under the htpasswd SHA-1 scheme.
    std::fs::write(
        &passwd_path,
        "# test users\nalice:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=\n",
    )?;

    let mut config = local_config();
    config.password_file = Some(passwd_path.clone());
    let (addr, _shutdown) = start_broker(config).await?;

    let mut rejected = Client::connect(addr, Credentials::htpasswd("alice", "wrong")).await?;
    assert!(recv_within(&mut rejected, 2000).await.is_none());

    // The right password authenticates and the session works.
    let mut alice = Client::connect(addr, Credentials::htpasswd("alice", "password")).await?;
    let mut publisher = Client::connect(addr, Credentials::none()).await?;

    publisher.listen("pw.topic").await?;
    alice.subscribe("pw.topic").await?;
    let Message::ForwardedSubscriptionRequest(n) = expect_message(&mut publisher).await? else {
        anyhow::bail!("expected a subscription notification");
    };
    assert_eq!(n.user, "alice");

    publisher
        .publish("pw.topic", vec![DataPacket::new(0, "", b"ok".to_vec())])
        .await?;
    assert!(matches!(
        expect_message(&mut alice).await?,
        Message::ForwardedMulticastData(_)
    ));

    std::fs::remove_file(&passwd_path).ok();
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_every_session() -> anyhow::Result<()> {
    let (addr, shutdown) = start_broker(local_config()).await?;

    let mut client = Client::connect(addr, Credentials::none()).await?;
    client.subscribe("t").await?;

    shutdown.cancel();

    // The broker closes the connection; the stream ends.
    assert!(recv_within(&mut client, 2000).await.is_none());
    Ok(())
}
