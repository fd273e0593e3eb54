#![cfg(all(unix, feature = "cli"))]

use std::time::Duration;

use bytes::Bytes;
use subwire::client::{Client, ClientError, FatalCause};

const WAIT: Duration = Duration::from_secs(10);

fn spawn_memory_backend() -> Client {
    Client::spawn(
        env!("CARGO_BIN_EXE_subwire"),
        ["--log-level", "error", "stdio", "--backend", "memory"],
    )
    .expect("backend should spawn")
}

#[tokio::test]
async fn client_over_child_stdio_receives_own_publication() {
    let client = spawn_memory_backend();

    let info = tokio::time::timeout(WAIT, client.info())
        .await
        .expect("info should arrive")
        .expect("backend should announce itself");
    assert_eq!(info["name"], "subwire-memory");
    assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));

    let subscription = client.dial("mytopic").await.expect("dial should succeed");
    subscription
        .send(Bytes::from_static(b"hello"))
        .await
        .expect("publish should enqueue");

    let payload = tokio::time::timeout(WAIT, subscription.receive())
        .await
        .expect("message should arrive")
        .expect("subscription should be open");
    assert_eq!(payload.as_ref(), b"hello");

    client.close().await;
    assert!(matches!(
        subscription.receive().await,
        Err(ClientError::Closed)
    ));
}

#[tokio::test]
async fn backend_exit_is_end_of_stream() {
    let client = Client::spawn("true", std::iter::empty::<&str>()).expect("true should spawn");

    let err = tokio::time::timeout(WAIT, client.info())
        .await
        .expect("info should resolve")
        .expect_err("no INFO from an exited process");
    assert!(matches!(err, ClientError::Fatal(FatalCause::EndOfStream)));
}
