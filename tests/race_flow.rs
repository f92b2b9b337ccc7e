//! End-to-end race flow over a real WebSocket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use tap_race::{GameServer, ServerConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (Arc<GameServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(GameServer::new(ServerConfig::default()));

    let runner = server.clone();
    tokio::spawn(async move {
        runner.run_on(listener).await.unwrap();
    });

    (server, format!("ws://{}", addr))
}

async fn connect(url: &str) -> Socket {
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Read frames until one of type `kind` arrives.
async fn expect(socket: &mut Socket, kind: &str) -> Value {
    let wait = async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["type"] == kind {
                        return frame;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended while waiting for {}: {:?}", kind, other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
}

async fn join(socket: &mut Socket, room: &str, name: &str) -> String {
    send(socket, json!({ "type": "joinRoom", "roomId": room, "playerName": name })).await;
    let joined = expect(socket, "joinedRoom").await;
    joined["connectionId"].as_str().unwrap().to_string()
}

async fn wait_for_rooms(server: &GameServer, expected: usize) {
    for _ in 0..100 {
        if server.room_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("room count never reached {}", expected);
}

#[tokio::test]
async fn test_two_runners_finish_race() {
    let (server, url) = start_server().await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;

    let a_id = join(&mut a, "r1", "Mo").await;
    // A sees its own arrival first
    let alone = expect(&mut a, "playerJoined").await;
    assert_eq!(alone["players"].as_object().unwrap().len(), 1);

    let b_id = join(&mut b, "r1", "Zed").await;
    assert_ne!(a_id, b_id);

    let joined = expect(&mut a, "playerJoined").await;
    assert_eq!(joined["players"].as_object().unwrap().len(), 2);
    assert_eq!(joined["players"][&b_id]["playerNum"], 2);

    send(&mut a, json!({ "type": "startGame", "roomId": "r1" })).await;
    expect(&mut a, "gameStarted").await;
    expect(&mut b, "gameStarted").await;

    send(&mut a, json!({ "type": "playerAction", "roomId": "r1" })).await;
    let update = expect(&mut b, "updateState").await;
    assert_eq!(update["speeds"][&a_id], 2.0);
    assert_eq!(update["speeds"][&b_id], 0.0);

    send(&mut a, json!({ "type": "checkFinish", "roomId": "r1", "finishTime": 7.5 })).await;
    send(&mut b, json!({ "type": "checkFinish", "roomId": "r1", "finishTime": 9.25 })).await;

    let result = expect(&mut a, "endRace").await;
    assert_eq!(result["finishTimes"][&a_id], 7.5);
    assert_eq!(result["finishTimes"][&b_id], 9.25);
    let result_b = expect(&mut b, "endRace").await;
    assert_eq!(result, result_b);

    server.shutdown();
}

#[tokio::test]
async fn test_fifth_runner_gets_room_full() {
    let (server, url) = start_server().await;
    let mut seated = Vec::new();
    for n in 0..4 {
        let mut socket = connect(&url).await;
        join(&mut socket, "busy", &format!("P{}", n)).await;
        seated.push(socket);
    }

    let mut late = connect(&url).await;
    send(&mut late, json!({ "type": "joinRoom", "roomId": "busy", "playerName": "Late" })).await;
    let full = expect(&mut late, "roomFull").await;
    assert_eq!(full["roomId"], "busy");

    server.shutdown();
}

#[tokio::test]
async fn test_bad_frames_get_error_reply() {
    let (server, url) = start_server().await;
    let mut socket = connect(&url).await;

    socket.send(Message::Text("not json".to_string())).await.unwrap();
    let err = expect(&mut socket, "error").await;
    assert_eq!(err["code"], "invalid_input");

    send(&mut socket, json!({ "type": "joinRoom", "roomId": "r1", "playerName": "  " })).await;
    expect(&mut socket, "error").await;
    assert_eq!(server.room_count().await, 0);

    server.shutdown();
}

#[tokio::test]
async fn test_disconnect_collects_empty_room() {
    let (server, url) = start_server().await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;

    join(&mut a, "r2", "Mo").await;
    let b_id = join(&mut b, "r2", "Zed").await;
    wait_for_rooms(&server, 1).await;

    b.close(None).await.unwrap();
    let left = expect(&mut a, "playerLeft").await;
    assert!(left["players"].get(&b_id).is_none());

    a.close(None).await.unwrap();
    wait_for_rooms(&server, 0).await;

    server.shutdown();
}
