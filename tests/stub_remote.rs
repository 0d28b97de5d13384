//! End-to-end tests against an in-process stub remote speaking the v1 wire
//! format.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant};

use modlink::{ArgValue, Command, LinkClient, LinkError, LinkOptions};

/// Sentinel reply instructing the stub to drop the connection.
const CLOSE: &str = "<close>";

type Handler = Arc<dyn Fn(usize, &str) -> Vec<String> + Send + Sync>;

async fn serve_conn(conn: usize, stream: TcpStream, handler: Handler) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    match lines.next_line().await {
        Ok(Some(line)) if line == "H 1" => {
            if write_half.write_all(b"H 1\n").await.is_err() {
                return;
            }
        }
        _ => return,
    }

    while let Ok(Some(line)) = lines.next_line().await {
        for reply in handler(conn, &line) {
            if reply == CLOSE {
                return;
            }
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

async fn start_stub(handler: Handler) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut conn = 0;
        while let Ok((stream, _)) = listener.accept().await {
            conn += 1;
            tokio::spawn(serve_conn(conn, stream, handler.clone()));
        }
    });
    addr
}

fn command_parts(line: &str) -> (u64, String, Vec<String>) {
    let tokens: Vec<&str> = line.split(' ').collect();
    assert_eq!(tokens[0], "C", "stub only understands command frames: {line}");
    (
        tokens[1].parse().unwrap(),
        tokens[2].to_string(),
        tokens[3..].iter().map(|s| s.to_string()).collect(),
    )
}

fn quick_options() -> LinkOptions {
    LinkOptions::new()
        .with_connect_timeout(Duration::from_secs(2))
        .with_read_timeout(Duration::from_secs(5))
        .with_max_reconnect_attempts(5)
        .with_backoff_base(Duration::from_millis(10))
}

async fn connect(addr: SocketAddr) -> LinkClient {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("modlink=trace")
        .try_init();
    LinkClient::connect(&addr.to_string(), quick_options())
        .await
        .unwrap()
}

#[tokio::test]
async fn get_block_round_trips_through_the_wire() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    let addr = start_stub(Arc::new(move |_, line| {
        seen_in_handler.lock().unwrap().push(line.to_string());
        let (id, name, _) = command_parts(line);
        if name == "world.get_block" {
            vec![format!("R {id} ok s:stone\n")]
        } else {
            vec![]
        }
    }))
    .await;

    let client = connect(addr).await;
    let block = client.get_block(0, 64, 0).await.unwrap();
    assert_eq!(block.kind, "stone");
    assert_eq!((block.x, block.y, block.z), (0, 64, 0));

    // Codec symmetry: the stub saw exactly the frame this client encodes.
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec!["C 1 world.get_block c:0,64,0"]);
}

#[tokio::test]
async fn remote_errors_surface_verbatim() {
    let addr = start_stub(Arc::new(|_, line| {
        let (id, _, _) = command_parts(line);
        vec![format!("R {id} err bad_coords y%20out%20of%20range\n")]
    }))
    .await;

    let client = connect(addr).await;
    let err = client.set_block(0, -999, 0, "stone").await.unwrap_err();
    match err {
        LinkError::Remote { code, message } => {
            assert_eq!(code, "bad_coords");
            assert_eq!(message, "y out of range");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn out_of_order_responses_resolve_the_right_callers() {
    let held = Arc::new(Mutex::new(Vec::<(u64, String)>::new()));
    let held_in_handler = held.clone();
    let addr = start_stub(Arc::new(move |_, line| {
        let (id, name, _) = command_parts(line);
        let mut held = held_in_handler.lock().unwrap();
        held.push((id, name));
        if held.len() == 2 {
            // Answer in reverse submission order.
            held.iter()
                .rev()
                .map(|(id, name)| format!("R {id} ok s:{name}\n"))
                .collect()
        } else {
            vec![]
        }
    }))
    .await;

    let client = connect(addr).await;
    let (first, second) = tokio::join!(
        client.submit(Command::new("test.first")),
        client.submit(Command::new("test.second")),
    );
    assert_eq!(first.unwrap()[0].as_str(), Some("test.first"));
    assert_eq!(second.unwrap()[0].as_str(), Some("test.second"));
}

#[tokio::test]
async fn silent_remote_times_out_the_specific_request() {
    let addr = start_stub(Arc::new(|_, _| vec![])).await;
    let client = connect(addr).await;

    let err = client
        .submit_with_timeout(Command::new("test.silent"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::RequestTimeout));

    // The connection itself is still healthy.
    assert!(client.is_connected());
}

#[tokio::test]
async fn connection_drop_fails_pending_and_reconnect_recovers() {
    let addr = start_stub(Arc::new(|conn, line| {
        let (id, name, _) = command_parts(line);
        if conn == 1 {
            vec![CLOSE.to_string()]
        } else if name == "world.get_block" {
            vec![format!("R {id} ok s:stone\n")]
        } else {
            vec![]
        }
    }))
    .await;

    let client = connect(addr).await;
    let err = client.get_block(0, 64, 0).await.unwrap_err();
    assert!(matches!(err, LinkError::ConnectionLost));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !(client.is_connected() && client.generation() >= 2) {
        assert!(Instant::now() < deadline, "client did not reconnect in time");
        sleep(Duration::from_millis(20)).await;
    }

    let block = client.get_block(0, 64, 0).await.unwrap();
    assert_eq!(block.kind, "stone");
}

#[tokio::test]
async fn pushed_event_creates_tentative_snapshot_without_a_query() {
    let queries = Arc::new(Mutex::new(Vec::new()));
    let queries_in_handler = queries.clone();
    let addr = start_stub(Arc::new(move |_, line| {
        let (id, name, _) = command_parts(line);
        queries_in_handler.lock().unwrap().push(name.clone());
        if name == "events.prime" {
            vec![
                format!("R {id} ok\n"),
                "E entity:42 updated s:{\"hp\":20}\n".to_string(),
            ]
        } else {
            vec![format!("R {id} ok\n")]
        }
    }))
    .await;

    let client = connect(addr).await;
    let mut events = client.subscribe();
    client.submit(Command::new("events.prime")).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event should arrive")
        .unwrap();
    assert_eq!(event.target, "entity:42");
    assert_eq!(event.name, "updated");

    // Served from the tentative snapshot; no entity.get goes out.
    let snapshot = client.snapshot("entity:42").await.unwrap();
    assert_eq!(snapshot.attrs["hp"], 20);
    assert!(snapshot.version >= 1);
    assert_eq!(*queries.lock().unwrap(), vec!["events.prime"]);
}

#[tokio::test]
async fn snapshot_cache_serves_repeat_reads_locally() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let fetches_in_handler = fetches.clone();
    let addr = start_stub(Arc::new(move |_, line| {
        let (id, name, _) = command_parts(line);
        if name == "entity.get" {
            fetches_in_handler.fetch_add(1, Ordering::SeqCst);
            vec![format!("R {id} ok s:{{\"name\":\"Creeper\",\"hp\":20}}\n")]
        } else {
            vec![]
        }
    }))
    .await;

    let client = connect(addr).await;
    let first = client.snapshot("entity:7").await.unwrap();
    assert_eq!(first.attrs["name"], "Creeper");

    let second = client.snapshot("entity:7").await.unwrap();
    assert_eq!(second.version, first.version);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_commands_get_individual_outcomes() {
    let addr = start_stub(Arc::new(|_, line| {
        let (id, name, _) = command_parts(line);
        match name.as_str() {
            "batch.ok" => vec![format!("R {id} ok i:7\n")],
            "batch.bad" => vec![format!("R {id} err boom it%20broke\n")],
            _ => vec![],
        }
    }))
    .await;

    let client = connect(addr).await;
    let outcomes = client
        .submit_batch(&[Command::new("batch.ok"), Command::new("batch.bad")])
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].as_ref().unwrap()[0], ArgValue::Int(7));
    assert!(matches!(outcomes[1], Err(LinkError::Remote { .. })));
}

#[tokio::test]
async fn closed_client_fails_fast() {
    let addr = start_stub(Arc::new(|_, _| vec![])).await;
    let client = connect(addr).await;

    client.close();
    let err = client.post_chat("hi").await.unwrap_err();
    assert!(matches!(err, LinkError::ConnectionLost));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn exhausted_reconnects_leave_the_session_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Nothing is listening anymore, so reconnect attempts are refused.
        drop(listener);
        serve_conn(1, stream, Arc::new(|_, _| vec![CLOSE.to_string()])).await;
    });

    let options = quick_options()
        .with_max_reconnect_attempts(2)
        .with_backoff_base(Duration::from_millis(10));
    let client = LinkClient::connect(&addr.to_string(), options).await.unwrap();

    let err = client.post_chat("trigger").await.unwrap_err();
    assert!(matches!(err, LinkError::ConnectionLost));

    // A send issued during reconnection blocks until the ceiling is
    // exhausted, then fails; afterwards the failure is immediate.
    let err = tokio::time::timeout(Duration::from_secs(5), client.post_chat("again"))
        .await
        .expect("send must not block past reconnect exhaustion")
        .unwrap_err();
    assert!(matches!(err, LinkError::ConnectionLost));
    assert!(!client.is_connected());
}
