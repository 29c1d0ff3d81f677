//! Integration tests: drive a real `Connection` over loopback TCP against
//! a scripted mock server, one scenario per test.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ami_client::{Action, Connection, ConnectionConfig, KeyValRecord, Reaction};
use ami_test_support::{MockAmiServer, extract_action_id, read_one_message};
use tokio::io::AsyncWriteExt;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

async fn connect_to(server: &MockAmiServer) -> Connection {
    let addr = server.local_addr();
    let config = ConnectionConfig::new(addr.ip().to_string(), addr.port());
    Connection::connect(config).await.unwrap()
}

fn ping() -> Action {
    Action::new("Ping", KeyValRecord::with_schema(Vec::<String>::new()))
}

#[tokio::test]
async fn ping_round_trips() {
    init_tracing();
    let server = MockAmiServer::start("Asterisk Call Manager/7.0.1", |mut stream| async move {
        let msg = read_one_message(&mut stream).await.unwrap();
        let id = extract_action_id(&msg);
        let reply = format!("Response: Pong\r\nActionID: {id}\r\nPing: Pong\r\n\r\n");
        let _ = stream.write_all(reply.as_bytes()).await;
    })
    .await
    .unwrap();

    let conn = connect_to(&server).await;
    let reaction = conn.invoke(&ping()).await.unwrap();
    assert!(!reaction.is_success());
    match reaction {
        Reaction::Single(record) => assert_eq!(record.get("Response"), Some("Pong")),
        other => panic!("unexpected reaction: {other:?}"),
    }
    assert_eq!(conn.ami_version(), "Asterisk Call Manager/7.0.1");
    conn.close().await;
}

#[tokio::test]
async fn login_success_single_response() {
    init_tracing();
    let server = MockAmiServer::start("Asterisk Call Manager/7.0.1", |mut stream| async move {
        let msg = read_one_message(&mut stream).await.unwrap();
        let id = extract_action_id(&msg);
        let reply = format!(
            "Response: Success\r\nActionID: {id}\r\nMessage: Authentication accepted\r\n\r\n"
        );
        let _ = stream.write_all(reply.as_bytes()).await;
    })
    .await
    .unwrap();

    let conn = connect_to(&server).await;
    let mut fields = KeyValRecord::with_schema(["Username", "Secret"]);
    fields.set("Username", "admin").unwrap();
    fields.set("Secret", "hunter2").unwrap();
    let action = Action::new("Login", fields);

    let reaction = conn.invoke(&action).await.unwrap();
    assert!(reaction.is_success());
    conn.close().await;
}

#[tokio::test]
async fn event_list_assembles_across_multiple_writes() {
    init_tracing();
    let server = MockAmiServer::start("Asterisk Call Manager/7.0.1", |mut stream| async move {
        let msg = read_one_message(&mut stream).await.unwrap();
        let id = extract_action_id(&msg);

        let head = format!(
            "Response: Success\r\nActionID: {id}\r\nEventList: start\r\nMessage: Parked calls will follow\r\n\r\n"
        );
        let _ = stream.write_all(head.as_bytes()).await;

        for exten in ["701", "702"] {
            let middle = format!("Event: ParkedCall\r\nActionID: {id}\r\nExten: {exten}\r\n\r\n");
            let _ = stream.write_all(middle.as_bytes()).await;
        }

        let tail = format!(
            "Event: ParkedCallsComplete\r\nActionID: {id}\r\nEventList: Complete\r\nItems: 2\r\n\r\n"
        );
        let _ = stream.write_all(tail.as_bytes()).await;
    })
    .await
    .unwrap();

    let conn = connect_to(&server).await;
    let action = Action::new("ParkedCalls", KeyValRecord::with_schema(Vec::<String>::new()));
    let reaction = conn.invoke(&action).await.unwrap();
    assert!(reaction.is_success());
    assert_eq!(reaction.event_count(), 2);
    conn.close().await;
}

#[tokio::test]
async fn terminator_split_across_separate_socket_writes() {
    init_tracing();
    let server = MockAmiServer::start("Asterisk Call Manager/7.0.1", |mut stream| async move {
        let msg = read_one_message(&mut stream).await.unwrap();
        let id = extract_action_id(&msg);
        let reply = format!("Response: Pong\r\nActionID: {id}\r\nPing: Pong\r\n\r\n");

        let split = reply.len() - 2;
        let _ = stream.write_all(reply[..split].as_bytes()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = stream.write_all(reply[split..].as_bytes()).await;
    })
    .await
    .unwrap();

    let conn = connect_to(&server).await;
    let reaction = conn.invoke(&ping()).await.unwrap();
    match reaction {
        Reaction::Single(record) => assert_eq!(record.get("Response"), Some("Pong")),
        other => panic!("unexpected reaction: {other:?}"),
    }
    conn.close().await;
}

#[tokio::test]
async fn timeout_then_late_arrival_reaches_subscriber() {
    init_tracing();
    let server = MockAmiServer::start("Asterisk Call Manager/7.0.1", |mut stream| async move {
        let msg = read_one_message(&mut stream).await.unwrap();
        let id = extract_action_id(&msg);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let reply = format!("Response: Pong\r\nActionID: {id}\r\nPing: Pong\r\n\r\n");
        let _ = stream.write_all(reply.as_bytes()).await;
    })
    .await
    .unwrap();

    let conn = connect_to(&server).await;

    let late_arrivals: Arc<Mutex<Vec<KeyValRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = late_arrivals.clone();
    conn.subscribe(move |record: &KeyValRecord| {
        sink.lock().unwrap().push(record.clone());
    });

    let action = ping();
    let outcome = conn.invoke_with_timeout(&action, Duration::from_millis(50)).await;
    assert!(matches!(outcome, Err(ami_client::AmiError::Timeout(_))));

    // The server's reply lands ~150ms after the timeout fires; give the
    // pipeline time to route it to the subscriber before asserting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let arrivals = late_arrivals.lock().unwrap();
    assert_eq!(arrivals.len(), 1);
    assert_eq!(arrivals[0].get("ActionID"), Some(action.action_id()));

    conn.close().await;
}

#[tokio::test]
async fn unsolicited_event_interleaved_during_event_list() {
    init_tracing();
    let server = MockAmiServer::start("Asterisk Call Manager/7.0.1", |mut stream| async move {
        let msg = read_one_message(&mut stream).await.unwrap();
        let id = extract_action_id(&msg);

        let head = format!(
            "Response: Success\r\nActionID: {id}\r\nEventList: start\r\nMessage: Parked calls will follow\r\n\r\n"
        );
        let _ = stream.write_all(head.as_bytes()).await;

        let middle = format!("Event: ParkedCall\r\nActionID: {id}\r\nExten: 701\r\n\r\n");
        let _ = stream.write_all(middle.as_bytes()).await;

        // An unrelated unsolicited event, with no ActionID, arrives mid-list.
        let _ = stream
            .write_all(b"Event: Newchannel\r\nChannel: SIP/999\r\n\r\n")
            .await;

        let tail = format!(
            "Event: ParkedCallsComplete\r\nActionID: {id}\r\nEventList: Complete\r\nItems: 1\r\n\r\n"
        );
        let _ = stream.write_all(tail.as_bytes()).await;
    })
    .await
    .unwrap();

    let conn = connect_to(&server).await;

    let unsolicited: Arc<Mutex<Vec<KeyValRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = unsolicited.clone();
    conn.subscribe(move |record: &KeyValRecord| {
        sink.lock().unwrap().push(record.clone());
    });

    let action = Action::new("ParkedCalls", KeyValRecord::with_schema(Vec::<String>::new()));
    let reaction = conn.invoke(&action).await.unwrap();
    assert!(reaction.is_success());
    assert_eq!(reaction.event_count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = unsolicited.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].get("Event"), Some("Newchannel"));

    conn.close().await;
}
