//! End-to-end tests driving `Connection` over an in-memory duplex stream
//! standing in for a real server, covering scenarios unit tests can't reach
//! on their own: a full `HELLO` handshake, pipelined commands sharing one
//! flush, pub/sub message delivery, and cache invalidation pushes.

use resp3client::cache::slot_for_key;
use resp3client::codec::Decoder;
use resp3client::config::Dialer;
use resp3client::connection::Connection;
use resp3client::value::{RedisValue, ValueKind};
use std::sync::Arc;
use tokio::io::{split, AsyncWriteExt, BufReader};

/// Runs a fake server loop over one half of a duplex pair: decodes each
/// incoming command (a RESP3 array of bulk strings) and calls `respond`
/// with the command's tokens to get back the raw bytes to write.
async fn run_fake_server<F>(stream: tokio::io::DuplexStream, mut respond: F)
where
    F: FnMut(Vec<String>) -> Vec<u8> + Send + 'static,
{
    let (read_half, write_half) = split(stream);
    let mut decoder = Decoder::new(BufReader::new(read_half));
    let mut writer = write_half;
    loop {
        let value = match decoder.decode_value().await {
            Ok(v) => v,
            Err(_) => return,
        };
        let tokens: Vec<String> = match value.to_slice() {
            Ok(items) => items.iter().filter_map(|v| v.to_string().ok()).collect(),
            Err(_) => continue,
        };
        let out = respond(tokens);
        if writer.write_all(&out).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

fn hello_reply() -> Vec<u8> {
    b"%3\r\n+server\r\n+resp3client-fake\r\n+version\r\n+7.4.0\r\n+proto\r\n:3\r\n".to_vec()
}

#[tokio::test]
async fn handshake_then_simple_command_round_trip() {
    let (client, server) = tokio::io::duplex(4096);
    tokio::spawn(run_fake_server(server, |tokens| match tokens[0].as_str() {
        "HELLO" => hello_reply(),
        "GET" => b"$5\r\nhello\r\n".to_vec(),
        _ => b"-ERR unknown\r\n".to_vec(),
    }));

    let dialer = Dialer::new();
    let conn = Connection::from_stream(client, &dialer).await.unwrap();
    assert!(conn.info().server_version.is_some());

    let handle = conn.submit(resp3client::commands::get("mykey").unwrap()).unwrap();
    let value = handle.value(None).await.unwrap();
    assert_eq!(value.to_string().unwrap(), "hello");
}

#[tokio::test]
async fn pipeline_of_many_commands_preserves_order() {
    let (client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(run_fake_server(server, |tokens| match tokens[0].as_str() {
        "HELLO" => hello_reply(),
        "GET" => {
            let key = &tokens[1];
            format!("${}\r\n{}\r\n", key.len(), key).into_bytes()
        }
        _ => b"-ERR unknown\r\n".to_vec(),
    }));

    let dialer = Dialer::new();
    let conn = Connection::from_stream(client, &dialer).await.unwrap();

    let mut pipeline = resp3client::pipeline::Pipeline::new();
    for i in 0..1000 {
        pipeline.queue(resp3client::commands::get(&format!("key{i}")).unwrap());
    }
    let handles = pipeline.flush(&conn).unwrap();
    assert_eq!(handles.len(), 1000);
    for (i, handle) in handles.into_iter().enumerate() {
        let value = handle.value(None).await.unwrap();
        assert_eq!(value.to_string().unwrap(), format!("key{i}"));
    }
}

#[tokio::test]
async fn pubsub_message_is_delivered_to_registered_channel() {
    let (client, server) = tokio::io::duplex(4096);
    let (server_reply_tx, mut server_reply_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let (read_half, write_half) = split(server);
        let mut decoder = Decoder::new(BufReader::new(read_half));
        let mut writer = write_half;
        loop {
            tokio::select! {
                decoded = decoder.decode_value() => {
                    let value = match decoded {
                        Ok(v) => v,
                        Err(_) => return,
                    };
                    let tokens: Vec<String> = value
                        .to_slice()
                        .map(|items| items.iter().filter_map(|v| v.to_string().ok()).collect())
                        .unwrap_or_default();
                    let out = match tokens.first().map(String::as_str) {
                        Some("HELLO") => hello_reply(),
                        Some("SUBSCRIBE") => {
                            let chan = &tokens[1];
                            format!(
                                ">3\r\n$9\r\nsubscribe\r\n${}\r\n{}\r\n:1\r\n",
                                chan.len(),
                                chan
                            )
                            .into_bytes()
                        }
                        _ => b"-ERR unknown\r\n".to_vec(),
                    };
                    if writer.write_all(&out).await.is_err() { return; }
                    if writer.flush().await.is_err() { return; }
                }
                Some(extra) = server_reply_rx.recv() => {
                    if writer.write_all(&extra).await.is_err() { return; }
                    if writer.flush().await.is_err() { return; }
                }
            }
        }
    });

    let dialer = Dialer::new();
    let conn = Connection::from_stream(client, &dialer).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let callback: resp3client::request::SubscribeCallback = Arc::new(move |_pattern, channel, payload| {
        assert_eq!(channel, "news");
        assert_eq!(payload.to_string().unwrap(), "breaking");
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });

    let handle = conn
        .submit_with_callback(
            resp3client::commands::subscribe(&["news".into()]).unwrap(),
            callback,
            vec!["news".into()],
        )
        .unwrap();
    handle.value(None).await.unwrap();

    server_reply_tx
        .send(b">3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$8\r\nbreaking\r\n".to_vec())
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), rx)
        .await
        .expect("message delivered before timeout")
        .unwrap();
}

#[tokio::test]
async fn invalidate_push_clears_the_affected_slot() {
    let (client, server) = tokio::io::duplex(4096);
    let (server_reply_tx, mut server_reply_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let (read_half, write_half) = split(server);
        let mut decoder = Decoder::new(BufReader::new(read_half));
        let mut writer = write_half;
        loop {
            tokio::select! {
                decoded = decoder.decode_value() => {
                    if decoded.is_err() { return; }
                    if writer.write_all(&hello_reply()).await.is_err() { return; }
                    if writer.flush().await.is_err() { return; }
                }
                Some(extra) = server_reply_rx.recv() => {
                    if writer.write_all(&extra).await.is_err() { return; }
                    if writer.flush().await.is_err() { return; }
                }
            }
        }
    });

    let invoked_keys: Arc<std::sync::Mutex<Option<Option<Vec<String>>>>> =
        Arc::new(std::sync::Mutex::new(None));
    let invoked_keys2 = invoked_keys.clone();
    let mut dialer = Dialer::new();
    dialer.invalidate_callback = Some(Arc::new(move |keys| {
        *invoked_keys2.lock().unwrap() = Some(keys);
    }));
    let conn = Connection::from_stream(client, &dialer).await.unwrap();
    let cache = conn.cache().expect("cache enabled by invalidate callback").clone();
    cache.put(b"foo", RedisValue::new(ValueKind::SimpleString("bar".into())));
    let slot = slot_for_key(b"foo");

    server_reply_tx
        .send(b">2\r\n$10\r\ninvalidate\r\n*1\r\n$3\r\nfoo\r\n".to_vec())
        .unwrap();

    let mut attempts = 0;
    while cache.get(b"foo").is_some() && attempts < 200 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        attempts += 1;
    }
    assert!(cache.get(b"foo").is_none(), "slot {slot} should have been invalidated");
    assert_eq!(
        invoked_keys.lock().unwrap().clone(),
        Some(Some(vec!["foo".to_string()])),
        "invalidate callback should fire with the decoded key list"
    );
}
