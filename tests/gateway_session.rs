//! Gateway session tests against a local zlib-stream websocket server

use arrakis_transport::codec::GatewayPayload;
use arrakis_transport::events::{EventDispatcher, EventRouter};
use arrakis_transport::metrics::GatewayMetrics;
use arrakis_transport::shard::{Phase, Shard, ShardConfig, ShardManager, ShardNotice, ShardState};
use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

/// Server half of a zlib-stream: one compression context per socket
struct Deflater(Compress);

impl Deflater {
    fn new() -> Self {
        Self(Compress::new(Compression::default(), true))
    }

    fn message(&mut self, value: &Value) -> Vec<u8> {
        let input = serde_json::to_vec(value).unwrap();
        let mut out = Vec::with_capacity(input.len() * 2 + 1024);
        self.0
            .compress_vec(&input, &mut out, FlushCompress::Sync)
            .unwrap();
        assert!(out.ends_with(&[0x00, 0x00, 0xff, 0xff]));
        out
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(String, Value)>>,
}

impl Recorder {
    fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl EventDispatcher for Recorder {
    fn dispatch(&self, event: &str, payload: &Value) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));
    }
}

fn shard_config(addr: SocketAddr, heartbeat_timeout: Duration) -> Arc<ShardConfig> {
    Arc::new(ShardConfig {
        token: "test-token".to_string(),
        intents: 3,
        gateway_url: format!("ws://{addr}"),
        version: 10,
        heartbeat_timeout,
        command_limit: 120,
        gateway_enabled: true,
    })
}

fn capped_config(addr: SocketAddr, heartbeat_timeout: Duration, command_limit: u32) -> Arc<ShardConfig> {
    let mut config = (*shard_config(addr, heartbeat_timeout)).clone();
    config.command_limit = command_limit;
    Arc::new(config)
}

fn standalone_shard(
    addr: SocketAddr,
    heartbeat_timeout: Duration,
    recorder: Arc<Recorder>,
) -> (Arc<Shard>, mpsc::UnboundedReceiver<ShardNotice>) {
    shard_with(shard_config(addr, heartbeat_timeout), recorder)
}

fn shard_with(
    config: Arc<ShardConfig>,
    recorder: Arc<Recorder>,
) -> (Arc<Shard>, mpsc::UnboundedReceiver<ShardNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shard = Shard::new(
        0,
        1,
        config,
        Arc::new(EventRouter::new(recorder)),
        tx,
        ShardState::new(0, 0..1, 1),
        Arc::new(GatewayMetrics::noop()),
    )
    .unwrap();
    (shard, rx)
}

async fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn send(ws: &mut ServerSocket, deflater: &mut Deflater, value: Value) {
    ws.send(Message::Binary(deflater.message(&value))).await.unwrap();
}

async fn hello(ws: &mut ServerSocket, deflater: &mut Deflater, interval_ms: u64) {
    send(ws, deflater, json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})).await;
}

/// Next non-heartbeat command from the client
async fn next_command(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["op"] != 1 {
                    return value;
                }
            }
            Some(Ok(_)) => continue,
            other => panic!("socket ended before a command: {other:?}"),
        }
    }
}

/// Close code the client sends when it tears the socket down
async fn close_code(ws: &mut ServerSocket) -> Option<u16> {
    while let Some(message) = ws.next().await {
        if let Ok(Message::Close(frame)) = message {
            return frame.map(|f| u16::from(f.code));
        }
    }
    None
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn hello_triggers_identify_with_shard_info() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());
    let (shard, _notices) = standalone_shard(addr, Duration::from_secs(60), Arc::clone(&recorder));

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut deflater = Deflater::new();
        hello(&mut ws, &mut deflater, 45_000).await;

        let identify = next_command(&mut ws).await;
        send(
            &mut ws,
            &mut deflater,
            json!({"op": 0, "s": 1, "t": "READY", "d": {"session_id": "abc", "guilds": [{"id": "1"}]}}),
        )
        .await;
        (ws, identify)
    });

    shard.connect().await.unwrap();
    let (_ws, identify) = server.await.unwrap();

    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], "test-token");
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(identify["d"]["intents"], 3);

    wait_until(|| shard.session_id().is_some()).await;
    assert_eq!(shard.session_id().as_deref(), Some("abc"));
    assert_eq!(shard.sequence(), Some(1));
    assert_eq!(shard.phase(), Phase::Steady);

    let names = recorder.names();
    assert_eq!(names.first().map(String::as_str), Some("websocket_message_receive"));
    assert!(names.contains(&"raw_ready".to_string()));
    assert!(names.contains(&"ready".to_string()));
}

#[tokio::test]
async fn dispatches_arrive_in_order_across_split_frames() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());
    let (shard, _notices) = standalone_shard(addr, Duration::from_secs(60), Arc::clone(&recorder));

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut deflater = Deflater::new();
        hello(&mut ws, &mut deflater, 45_000).await;
        next_command(&mut ws).await;

        send(&mut ws, &mut deflater, json!({"op": 0, "s": 1, "t": "READY", "d": {"session_id": "abc"}})).await;

        // one message in two websocket frames
        let message = deflater.message(&json!({"op": 0, "s": 2, "t": "MESSAGE_CREATE", "d": {"id": "m1"}}));
        let (head, tail) = message.split_at(message.len() / 2);
        ws.send(Message::Binary(head.to_vec())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        ws.send(Message::Binary(tail.to_vec())).await.unwrap();

        send(&mut ws, &mut deflater, json!({"op": 0, "s": 3, "t": "GUILD_CREATE", "d": {"id": "g1"}})).await;
        ws
    });

    shard.connect().await.unwrap();
    let _ws = server.await.unwrap();

    wait_until(|| recorder.names().contains(&"raw_guild_create".to_string())).await;

    let raw: Vec<String> = recorder
        .names()
        .into_iter()
        .filter(|name| name.starts_with("raw_"))
        .collect();
    assert_eq!(raw, vec!["raw_ready", "raw_message_create", "raw_guild_create"]);
    assert_eq!(shard.sequence(), Some(3));

    let events = recorder.events.lock().unwrap();
    let message = events.iter().find(|(name, _)| name == "raw_message_create").unwrap();
    assert_eq!(message.1["id"], "m1");
}

#[tokio::test]
async fn corrupt_frame_is_dropped_and_session_continues() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());
    let (shard, mut notices) = standalone_shard(addr, Duration::from_secs(60), Arc::clone(&recorder));

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut deflater = Deflater::new();
        hello(&mut ws, &mut deflater, 45_000).await;
        next_command(&mut ws).await;

        ws.send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0xff, 0xff]))
            .await
            .unwrap();
        ws.send(Message::Text(
            json!({"op": 0, "s": 4, "t": "TYPING_START", "d": {}}).to_string(),
        ))
        .await
        .unwrap();
        ws
    });

    shard.connect().await.unwrap();
    let _ws = server.await.unwrap();

    wait_until(|| recorder.names().contains(&"raw_typing_start".to_string())).await;
    assert_eq!(shard.sequence(), Some(4));
    assert!(notices.try_recv().is_err());
    assert_ne!(shard.phase(), Phase::Disconnected);
}

#[tokio::test]
async fn reconnect_before_ready_resumes_on_next_connect() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());

    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        let mut deflater = Deflater::new();
        hello(&mut first, &mut deflater, 45_000).await;
        let identify = next_command(&mut first).await;
        send(&mut first, &mut deflater, json!({"op": 7, "d": null})).await;
        let close = close_code(&mut first).await;

        let mut second = accept(&listener).await;
        let mut deflater = Deflater::new();
        hello(&mut second, &mut deflater, 45_000).await;
        let resume = next_command(&mut second).await;
        (identify, close, resume, second)
    });

    let manager = ShardManager::new(
        0,
        1,
        shard_config(addr, Duration::from_secs(60)),
        Arc::new(EventRouter::new(recorder)),
        Arc::new(GatewayMetrics::noop()),
    )
    .unwrap();
    let shutdown = manager.shutdown_handle();
    let run = tokio::spawn(manager.run());

    let (identify, close, resume, _second) =
        tokio::time::timeout(Duration::from_secs(10), server).await.unwrap().unwrap();

    assert_eq!(identify["op"], 2);
    assert_eq!(close, Some(4000));
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["token"], "test-token");

    shutdown.send(()).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn stalled_socket_is_closed_as_zombie() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());
    let (shard, mut notices) = standalone_shard(addr, Duration::from_millis(200), recorder);

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut deflater = Deflater::new();
        // heartbeats flow out but are never acknowledged
        hello(&mut ws, &mut deflater, 100).await;
        close_code(&mut ws).await
    });

    shard.connect().await.unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(code, Some(4009));

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice, ShardNotice { shard_id: 0, reconnect: true, established: false });
    assert_eq!(shard.phase(), Phase::Reconnecting);
}

#[tokio::test]
async fn double_disconnect_notifies_once() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());
    let (shard, mut notices) = standalone_shard(addr, Duration::from_secs(60), recorder);

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut deflater = Deflater::new();
        hello(&mut ws, &mut deflater, 45_000).await;
        next_command(&mut ws).await;
        close_code(&mut ws).await
    });

    shard.connect().await.unwrap();
    wait_until(|| shard.phase() == Phase::Identifying).await;

    tokio::join!(shard.disconnect(1000, false), shard.disconnect(1000, false));

    let code = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(code, Some(1000));

    assert_eq!(notices.try_recv().unwrap(), ShardNotice { shard_id: 0, reconnect: false, established: false });
    assert!(notices.try_recv().is_err());
    assert_eq!(shard.phase(), Phase::Disconnected);

    shard.disconnect(1000, false).await;
    assert!(notices.try_recv().is_err());
}

/// Serves one socket: Hello, then a second Hello once the first Identify is
/// in, so the client owes another Identify with its command window spent.
async fn rehello_server(
    listener: TcpListener,
    interval_ms: u64,
    rehelloed: oneshot::Sender<()>,
) -> Option<u16> {
    let mut ws = accept(&listener).await;
    let mut deflater = Deflater::new();
    hello(&mut ws, &mut deflater, interval_ms).await;
    next_command(&mut ws).await;
    hello(&mut ws, &mut deflater, interval_ms).await;
    let _ = rehelloed.send(());
    close_code(&mut ws).await
}

#[tokio::test]
async fn disconnect_is_not_held_up_by_throttled_handshake() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());
    let (shard, mut notices) = shard_with(capped_config(addr, Duration::from_secs(60), 1), recorder);

    let (rehelloed, sent) = oneshot::channel();
    let server = tokio::spawn(rehello_server(listener, 45_000, rehelloed));

    shard.connect().await.unwrap();
    sent.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(shard.throttle().remaining(), 0);

    tokio::time::timeout(Duration::from_secs(2), shard.disconnect(1000, false))
        .await
        .expect("disconnect returned while the handshake waited for the command window");

    let code = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(code, Some(1000));
    assert_eq!(shard.phase(), Phase::Disconnected);
    assert_eq!(
        notices.try_recv().unwrap(),
        ShardNotice { shard_id: 0, reconnect: false, established: false }
    );
}

#[tokio::test]
async fn liveness_fires_while_handshake_is_throttled() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());
    let (shard, mut notices) = shard_with(capped_config(addr, Duration::from_millis(200), 1), recorder);

    let (rehelloed, _sent) = oneshot::channel();
    let server = tokio::spawn(rehello_server(listener, 100, rehelloed));

    shard.connect().await.unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(code, Some(4009));

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(notice.reconnect);
    assert_eq!(shard.phase(), Phase::Reconnecting);
}

#[tokio::test]
async fn heartbeats_bypass_spent_command_window() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());
    let (shard, _notices) = shard_with(capped_config(addr, Duration::from_secs(60), 1), recorder);

    let (frames_tx, mut frames) = mpsc::unbounded_channel::<Value>();
    let _server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut deflater = Deflater::new();
        hello(&mut ws, &mut deflater, 45_000).await;
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = frames_tx.send(serde_json::from_str(&text).unwrap());
            }
        }
    });

    shard.connect().await.unwrap();
    let identify = tokio::time::timeout(Duration::from_secs(5), frames.recv()).await.unwrap().unwrap();
    assert_eq!(identify["op"], 2);
    assert_eq!(shard.throttle().remaining(), 0);

    tokio::time::timeout(Duration::from_secs(1), shard.send(&GatewayPayload::heartbeat(Some(7))))
        .await
        .unwrap()
        .unwrap();
    let heartbeat = tokio::time::timeout(Duration::from_secs(1), frames.recv()).await.unwrap().unwrap();
    assert_eq!(heartbeat, json!({"op": 1, "d": 7}));

    let presence = GatewayPayload { op: 3, d: json!({"status": "idle"}), s: None, t: None };
    let parked = tokio::spawn({
        let shard = Arc::clone(&shard);
        async move { shard.send(&presence).await }
    });
    assert!(tokio::time::timeout(Duration::from_millis(200), frames.recv()).await.is_err());
    assert!(!parked.is_finished());

    shard.throttle().reset();
    let released = tokio::time::timeout(Duration::from_secs(1), frames.recv()).await.unwrap().unwrap();
    assert_eq!(released["op"], 3);
    parked.await.unwrap().unwrap();

    shard.disconnect(1000, false).await;
}

#[tokio::test]
async fn sessions_failing_before_ready_back_off() {
    let (listener, addr) = listener().await;
    let recorder = Arc::new(Recorder::default());

    let server = tokio::spawn(async move {
        let mut accepted = Vec::new();
        for _ in 0..3 {
            let mut ws = accept(&listener).await;
            accepted.push(Instant::now());
            let mut deflater = Deflater::new();
            hello(&mut ws, &mut deflater, 45_000).await;
            next_command(&mut ws).await;
            send(&mut ws, &mut deflater, json!({"op": 9, "d": false})).await;
            close_code(&mut ws).await;
        }
        accepted
    });

    let manager = ShardManager::new(
        0,
        1,
        shard_config(addr, Duration::from_secs(60)),
        Arc::new(EventRouter::new(recorder)),
        Arc::new(GatewayMetrics::noop()),
    )
    .unwrap();
    let shutdown = manager.shutdown_handle();
    let run = tokio::spawn(manager.run());

    let accepted = tokio::time::timeout(Duration::from_secs(15), server).await.unwrap().unwrap();
    assert!(accepted[1] - accepted[0] >= Duration::from_millis(900));
    assert!(accepted[2] - accepted[1] >= Duration::from_millis(1900));

    shutdown.send(()).unwrap();
    run.await.unwrap().unwrap();
}
