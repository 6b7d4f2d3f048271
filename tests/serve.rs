use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use secp256k1::{Keypair, Message, Secp256k1};
use sha2::{Digest, Sha256};
use std::{net::TcpListener, process::Command, time::Duration};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn signed_event_json(kind: u32, created_at: u64, content: &str) -> serde_json::Value {
    let secp = Secp256k1::new();
    let sk = [1u8; 32];
    let kp = Keypair::from_seckey_slice(&secp, &sk).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let tags: Vec<Vec<String>> = vec![];
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr).unwrap();
    let hash = Sha256::digest(&data);
    let id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    serde_json::json!({
        "id": id,
        "pubkey": pubkey,
        "kind": kind,
        "created_at": created_at,
        "tags": tags,
        "content": content,
        "sig": hex::encode(sig.as_ref()),
    })
}

async fn next_text(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> serde_json::Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(t) => return serde_json::from_str(&t).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn serve_cli_replays_and_fans_out() {
    let port = free_port();
    let mut child = Command::cargo_bin("memrelay")
        .unwrap()
        .args(["--addr", &format!("127.0.0.1:{port}")])
        .spawn()
        .unwrap();

    // allow the server to start
    sleep(Duration::from_millis(300)).await;

    // HTTP health check
    let url = format!("http://127.0.0.1:{port}/healthz");
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // NIP-11 document on Accept: application/nostr+json
    let client = reqwest::Client::new();
    let info: serde_json::Value = client
        .get(format!("http://127.0.0.1:{port}/"))
        .header("Accept", "application/nostr+json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["name"], "memrelay");

    // publish an event from one connection
    let ws_url = format!("ws://127.0.0.1:{port}/");
    let (mut publisher, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let stored = signed_event_json(1, unix_now(), "stored");
    publisher
        .send(WsMessage::Text(
            serde_json::json!(["EVENT", stored]).to_string(),
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    // a new subscriber replays it, sees EOSE, then receives the live tail
    let (mut subscriber, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    subscriber
        .send(WsMessage::Text(
            serde_json::json!(["REQ", "a", {"kinds": [1]}]).to_string(),
        ))
        .await
        .unwrap();

    let frame = next_text(&mut subscriber).await;
    assert_eq!(frame[0], "EVENT");
    assert_eq!(frame[1], "a");
    assert_eq!(frame[2]["content"], "stored");
    let frame = next_text(&mut subscriber).await;
    assert_eq!(frame[0], "EOSE");

    let live = signed_event_json(1, unix_now(), "live");
    publisher
        .send(WsMessage::Text(
            serde_json::json!(["EVENT", live]).to_string(),
        ))
        .await
        .unwrap();
    let frame = next_text(&mut subscriber).await;
    assert_eq!(frame[0], "EVENT");
    assert_eq!(frame[2]["content"], "live");

    // after CLOSE nothing more is delivered; a probe REQ bounds the wait
    subscriber
        .send(WsMessage::Text("[\"CLOSE\",\"a\"]".into()))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    let ignored = signed_event_json(1, unix_now(), "ignored");
    publisher
        .send(WsMessage::Text(
            serde_json::json!(["EVENT", ignored]).to_string(),
        ))
        .await
        .unwrap();
    subscriber
        .send(WsMessage::Text(
            serde_json::json!(["REQ", "probe", {"kinds": [42]}]).to_string(),
        ))
        .await
        .unwrap();
    let frame = next_text(&mut subscriber).await;
    assert_eq!(frame[0], "EOSE");
    assert_eq!(frame[1], "probe");

    child.kill().unwrap();
    let _ = child.wait();
}

#[tokio::test]
async fn serve_cli_applies_admission_filter() {
    let port = free_port();
    let mut child = Command::cargo_bin("memrelay")
        .unwrap()
        .args([
            "--addr",
            &format!("127.0.0.1:{port}"),
            "--admission-filter",
            r#"[{"kinds":[1]}]"#,
        ])
        .spawn()
        .unwrap();
    sleep(Duration::from_millis(300)).await;

    let ws_url = format!("ws://127.0.0.1:{port}/");
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let uncached = signed_event_json(9, unix_now(), "uncached");
    ws.send(WsMessage::Text(
        serde_json::json!(["EVENT", uncached]).to_string(),
    ))
    .await
    .unwrap();
    sleep(Duration::from_millis(200)).await;

    // not replayed: the admission filter kept it out of the cache
    ws.send(WsMessage::Text(
        serde_json::json!(["REQ", "a", {"kinds": [9]}]).to_string(),
    ))
    .await
    .unwrap();
    let frame = next_text(&mut ws).await;
    assert_eq!(frame[0], "EOSE");

    child.kill().unwrap();
    let _ = child.wait();
}
