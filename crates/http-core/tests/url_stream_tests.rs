//! End to end tests driving UrlStream and IcyStream against a local
//! canned HTTP server.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use audiocast_http_core::{IcyStream, MetaKind, Method, MetadataCallback, UrlStream, UrlStreamConfig};

/// Spawn a server that answers every connection with `reply`
async fn canned_server(reply: Vec<u8>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    let Ok(n) = socket.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                socket.write_all(&reply).await.ok();
                socket.flush().await.ok();
                // linger so the client can drain the body
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            });
        }
    });
    addr
}

async fn drain(stream: &mut UrlStream) -> Vec<u8> {
    let mut body = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = stream.read_bytes(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body
}

#[tokio::test]
async fn test_chunked_download() {
    let addr = canned_server(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n"
            .to_vec(),
    )
    .await;

    let mut cfg = UrlStreamConfig::default();
    cfg.timeout = std::time::Duration::from_secs(2);
    let mut stream = UrlStream::new(cfg);
    let ok = stream
        .begin(
            &format!("http://127.0.0.1:{}/file", addr.port()),
            None,
            Method::Get,
            None,
            None,
        )
        .await
        .unwrap();
    assert!(ok);

    let body = drain(&mut stream).await;
    assert_eq!(body, b"Hello World");
    assert_eq!(stream.total_read(), 11);
    assert_eq!(stream.available(), 0);
    stream.end().await;
}

#[tokio::test]
async fn test_redirect_is_followed() {
    let target = canned_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()).await;
    let redirect_reply = format!(
        "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{}/real\r\n\r\n",
        target.port()
    );
    let first = canned_server(redirect_reply.into_bytes()).await;

    let mut cfg = UrlStreamConfig::default();
    cfg.timeout = std::time::Duration::from_secs(2);
    let mut stream = UrlStream::new(cfg);
    let ok = stream
        .begin(
            &format!("http://127.0.0.1:{}/moved", first.port()),
            None,
            Method::Get,
            None,
            None,
        )
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(stream.url().unwrap().path(), "/real");

    let body = drain(&mut stream).await;
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn test_icy_stream_demuxes_metadata() {
    // icy-metaint 256: 256 audio bytes, size byte 2, 32 bytes of
    // metadata with the stream title, then another 256 audio bytes
    let metaint = 256usize;
    let mut body = Vec::new();
    let first_audio: Vec<u8> = (0..metaint).map(|i| (i % 251) as u8).collect();
    body.extend_from_slice(&first_audio);
    body.push(2);
    let mut meta = b"StreamTitle='Song A';".to_vec();
    meta.resize(32, 0);
    body.extend_from_slice(&meta);
    let second_audio: Vec<u8> = (0..metaint).map(|i| ((i * 7) % 251) as u8).collect();
    body.extend_from_slice(&second_audio);

    let mut reply = format!(
        "HTTP/1.1 200 OK\r\nicy-metaint: {}\r\nicy-name: Test Radio\r\nContent-Length: {}\r\n\r\n",
        metaint,
        body.len()
    )
    .into_bytes();
    reply.extend_from_slice(&body);
    let addr = canned_server(reply).await;

    let mut cfg = UrlStreamConfig::default();
    cfg.timeout = std::time::Duration::from_secs(2);
    let mut stream = IcyStream::new(cfg);

    let seen: Arc<Mutex<Vec<(MetaKind, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let callback: MetadataCallback = Arc::new(move |kind, value: &str| {
        seen_cb.lock().unwrap().push((kind, value.to_string()));
    });
    stream.set_metadata_callback(callback);

    let ok = stream
        .begin(&format!("http://127.0.0.1:{}/radio", addr.port()), None)
        .await
        .unwrap();
    assert!(ok);
    assert!(stream.has_metadata());

    let mut audio = Vec::new();
    let mut buf = [0u8; 100];
    loop {
        let n = stream.read_bytes(&mut buf).await.unwrap();
        if n == 0 && stream.available() == 0 {
            break;
        }
        audio.extend_from_slice(&buf[..n]);
        if audio.len() >= 2 * metaint {
            break;
        }
    }

    // the caller sees only the audio bytes, metadata removed
    let mut expected = first_audio.clone();
    expected.extend_from_slice(&second_audio);
    assert_eq!(audio, expected);

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&(MetaKind::Name, "Test Radio".to_string())));
    assert!(seen.contains(&(MetaKind::Title, "Song A".to_string())));
    // the title was delivered exactly once
    assert_eq!(
        seen.iter().filter(|(k, _)| *k == MetaKind::Title).count(),
        1
    );
}
