mod common;

use std::time::Duration;

use common::{builder, event_channel, next_event, start, TestServer};
use serde_json::json;
use signalrr_client::{ConnectionState, RetryContext, SignalRError};

fn immediate_retries(max_attempts: u32) -> impl Fn(&RetryContext) -> Option<Duration> + Send + Sync {
    move |context: &RetryContext| (context.previous_retry_count < max_attempts).then_some(Duration::ZERO)
}

#[tokio::test]
async fn reconnects_after_the_connection_is_lost() {
    common::init_tracing();
    let (factory, mut server) = TestServer::new();
    let connection = builder(&factory)
        .with_retry_policy(immediate_retries(5))
        .build()
        .unwrap();
    let (on_reconnecting, mut reconnecting) = event_channel::<SignalRError>();
    let (on_reconnected, mut reconnected) = event_channel::<Option<String>>();
    connection.on_reconnecting(on_reconnecting);
    connection.on_reconnected(on_reconnected);

    let remote = start(&connection, &mut server).await;
    remote.fail(SignalRError::Transport("connection reset".into())).await;

    let reason = next_event(&mut reconnecting).await;
    assert_eq!(reason.to_string(), "Transport error: connection reset");

    let mut remote = server.accept_connected().await;
    next_event(&mut reconnected).await;
    assert_eq!(connection.state(), ConnectionState::Connected);

    let call = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke::<u32>("Answer", vec![]).await })
    };
    let invocation = remote.read_message().await;
    remote
        .send_json(json!({"type": 3, "invocationId": invocation["invocationId"], "result": 42}))
        .await;
    assert_eq!(call.await.unwrap().unwrap(), 42);
}

#[tokio::test]
async fn gives_up_when_the_policy_says_so() {
    let (factory, mut server) = TestServer::new();
    let connection = builder(&factory)
        .with_retry_policy(immediate_retries(2))
        .build()
        .unwrap();
    let (on_reconnecting, mut reconnecting) = event_channel::<SignalRError>();
    let (on_closed, mut closed) = event_channel::<Option<SignalRError>>();
    connection.on_reconnecting(on_reconnecting);
    connection.on_closed(on_closed);

    let remote = start(&connection, &mut server).await;
    for _ in 0..5 {
        factory.fail_next_start(SignalRError::Transport("refused".into()));
    }
    remote.disconnect();

    let error = next_event(&mut closed).await.unwrap();
    match &error {
        SignalRError::ReconnectExhausted { attempts, reason, .. } => {
            assert_eq!(*attempts, 2);
            assert_eq!(reason.to_string(), "Transport error: refused");
        }
        other => panic!("unexpected close error {other:?}"),
    }
    assert!(error.is_cancellation());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    // One initial start plus two reconnect attempts.
    assert_eq!(factory.starts(), 3);
    // Reconnecting fires once per episode.
    next_event(&mut reconnecting).await;
    assert!(reconnecting.try_recv().is_err());
}

#[tokio::test]
async fn close_without_allow_reconnect_does_not_reconnect() {
    let (factory, mut server) = TestServer::new();
    let connection = builder(&factory)
        .with_retry_policy(immediate_retries(5))
        .build()
        .unwrap();
    let (on_reconnecting, mut reconnecting) = event_channel::<SignalRError>();
    let (on_closed, mut closed) = event_channel::<Option<SignalRError>>();
    connection.on_reconnecting(on_reconnecting);
    connection.on_closed(on_closed);

    let remote = start(&connection, &mut server).await;
    remote.send_json(json!({"type": 7})).await;

    assert!(next_event(&mut closed).await.is_none());
    assert!(reconnecting.try_recv().is_err());
    assert_eq!(factory.starts(), 1);
}

#[tokio::test]
async fn close_with_allow_reconnect_reconnects() {
    let (factory, mut server) = TestServer::new();
    let connection = builder(&factory)
        .with_retry_policy(immediate_retries(5))
        .build()
        .unwrap();
    let (on_reconnecting, mut reconnecting) = event_channel::<SignalRError>();
    connection.on_reconnecting(on_reconnecting);

    let remote = start(&connection, &mut server).await;
    remote
        .send_json(json!({"type": 7, "error": "restarting", "allowReconnect": true}))
        .await;

    let reason = next_event(&mut reconnecting).await;
    assert_eq!(
        reason.to_string(),
        "The server closed the connection with the following error: restarting"
    );
    let _remote = server.accept_connected().await;
}

#[tokio::test]
async fn stop_during_the_reconnect_delay_ends_reconnecting() {
    let (factory, mut server) = TestServer::new();
    let connection = builder(&factory)
        .with_retry_policy(|_: &RetryContext| Some(Duration::from_secs(60)))
        .build()
        .unwrap();
    let (on_reconnecting, mut reconnecting) = event_channel::<SignalRError>();
    let (on_closed, mut closed) = event_channel::<Option<SignalRError>>();
    connection.on_reconnecting(on_reconnecting);
    connection.on_closed(on_closed);

    let remote = start(&connection, &mut server).await;
    remote.disconnect();
    next_event(&mut reconnecting).await;
    assert_eq!(connection.state(), ConnectionState::Reconnecting);

    tokio::time::timeout(Duration::from_secs(5), connection.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(next_event(&mut closed).await.is_none());
    assert_eq!(factory.starts(), 1);
}

#[tokio::test]
async fn pending_invocations_fail_when_the_connection_is_lost() {
    let (factory, mut server) = TestServer::new();
    let connection = builder(&factory)
        .with_retry_policy(immediate_retries(5))
        .build()
        .unwrap();
    let mut remote = start(&connection, &mut server).await;

    let call = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke::<()>("Slow", vec![]).await })
    };
    remote.read_message().await;
    remote.disconnect();

    assert!(matches!(
        call.await.unwrap(),
        Err(SignalRError::ConnectionClosed)
    ));
    let _remote = server.accept_connected().await;
}

#[tokio::test]
async fn without_a_policy_the_connection_closes() {
    let (factory, mut server) = TestServer::new();
    let connection = builder(&factory).build().unwrap();
    let (on_closed, mut closed) = event_channel::<Option<SignalRError>>();
    connection.on_closed(on_closed);

    let remote = start(&connection, &mut server).await;
    remote.fail(SignalRError::Transport("connection reset".into())).await;

    let error = next_event(&mut closed).await.unwrap();
    assert_eq!(error.to_string(), "Transport error: connection reset");
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}
