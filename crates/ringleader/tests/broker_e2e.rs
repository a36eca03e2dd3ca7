//! End-to-end scenarios over the connection flavor.
//!
//! Broker, workers, and clients run as separate tasks in one process and
//! talk only through the transport, with a cancellation token standing in
//! for the supervisor pipe.

use std::time::Duration;

use bytes::Bytes;
use ringleader::{Broker, BrokerConfig};
use ringproto::endpoint::Flavor;
use ringproto::{Client, ClientConfig, Worker, WorkerConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(50);

async fn start_broker(address: &str) -> (JoinHandle<()>, String, CancellationToken) {
    let config = BrokerConfig::default().with_heartbeat_interval(TICK);
    let mut broker = Broker::bind(Flavor::Connection, address, config)
        .await
        .expect("broker bind");
    let local = broker.local_addr().to_string();
    let token = CancellationToken::new();
    let guard = token.clone();
    let handle = tokio::spawn(async move {
        broker.run(guard).await.expect("broker run");
    });
    (handle, local, token)
}

fn short_worker_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_heartbeat_interval(TICK)
        .with_reconnect(TICK)
}

fn spawn_echo_worker(address: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut worker =
            Worker::connect(Flavor::Connection, &address, "echo", short_worker_config())
                .await
                .expect("worker connect");
        let mut reply = Vec::new();
        loop {
            match worker.work(reply).await {
                Ok(request) if request.is_empty() => break,
                Ok(request) => reply = request,
                Err(_) => break,
            }
        }
    })
}

async fn connect_client(address: &str) -> Client {
    Client::connect(
        Flavor::Connection,
        address,
        ClientConfig::default().with_recv_timeout(Duration::from_secs(2)),
    )
    .await
    .expect("client connect")
}

#[tokio::test(flavor = "multi_thread")]
async fn single_echo_roundtrip() {
    let (broker, address, shutdown) = start_broker("inproc://e2e-single-echo").await;
    let worker = spawn_echo_worker(address.clone());

    let mut client = connect_client(&address).await;
    client
        .send("echo", vec![Bytes::from_static(b"hello")])
        .await
        .unwrap();
    let (service, body) = client.recv().await.unwrap().expect("echo reply");
    assert_eq!(service, "echo");
    assert_eq!(body, vec![Bytes::from_static(b"hello")]);

    worker.abort();
    shutdown.cancel();
    broker.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn countdown_replies_arrive_in_order() {
    let (broker, address, shutdown) = start_broker("inproc://e2e-countdown").await;
    let worker = spawn_echo_worker(address.clone());

    let mut client = connect_client(&address).await;
    for message in ["3...", "2...", "1...", "blast off!"] {
        client
            .send("echo", vec![Bytes::copy_from_slice(message.as_bytes())])
            .await
            .unwrap();
        let (service, body) = client.recv().await.unwrap().expect("countdown reply");
        assert_eq!(service, "echo");
        assert_eq!(body, vec![Bytes::copy_from_slice(message.as_bytes())]);
    }

    worker.abort();
    shutdown.cancel();
    broker.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn multipart_bodies_survive_the_roundtrip() {
    let (broker, address, shutdown) = start_broker("inproc://e2e-multipart").await;
    let worker = spawn_echo_worker(address.clone());

    let mut client = connect_client(&address).await;
    let body = vec![
        Bytes::from_static(b"part one"),
        Bytes::new(),
        Bytes::from(vec![0xA5; 700]),
    ];
    client.send("echo", body.clone()).await.unwrap();
    let (_, echoed) = client.recv().await.unwrap().expect("echo reply");
    assert_eq!(echoed, body);

    worker.abort();
    shutdown.cancel();
    broker.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unstaffed_service_yields_no_reply() {
    let (broker, address, shutdown) = start_broker("inproc://e2e-unstaffed").await;

    let mut client = Client::connect(
        Flavor::Connection,
        &address,
        ClientConfig::default().with_recv_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();
    client
        .send("nobody", vec![Bytes::from_static(b"anyone there?")])
        .await
        .unwrap();
    assert_eq!(client.recv().await.unwrap(), None);

    shutdown.cancel();
    broker.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_worker_is_purged_and_mmi_notices() {
    let (broker, address, shutdown) = start_broker("inproc://e2e-purge").await;

    // Register, then stop ungracefully: the worker never polls again.
    let worker = Worker::connect(Flavor::Connection, &address, "echo", short_worker_config())
        .await
        .unwrap();

    let mut client = connect_client(&address).await;
    client
        .send("mmi.service", vec![Bytes::from_static(b"echo")])
        .await
        .unwrap();
    let (_, body) = client.recv().await.unwrap().expect("mmi reply");
    assert_eq!(body, vec![Bytes::from_static(b"200")]);

    drop(worker);

    // Past the expiry window (three ticks) plus slack for the purge tick.
    tokio::time::sleep(TICK * 6).await;

    client
        .send("mmi.service", vec![Bytes::from_static(b"echo")])
        .await
        .unwrap();
    let (_, body) = client.recv().await.unwrap().expect("mmi reply");
    assert_eq!(body, vec![Bytes::from_static(b"404")]);

    shutdown.cancel();
    broker.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn two_workers_share_a_service() {
    let (broker, address, shutdown) = start_broker("inproc://e2e-two-workers").await;
    let first = spawn_echo_worker(address.clone());
    let second = spawn_echo_worker(address.clone());

    let mut client = connect_client(&address).await;
    for n in 0..6 {
        let message = format!("request {n}");
        client
            .send("echo", vec![Bytes::copy_from_slice(message.as_bytes())])
            .await
            .unwrap();
        let (_, body) = client.recv().await.unwrap().expect("echo reply");
        assert_eq!(body, vec![Bytes::copy_from_slice(message.as_bytes())]);
    }

    first.abort();
    second.abort();
    shutdown.cancel();
    broker.await.unwrap();
}
