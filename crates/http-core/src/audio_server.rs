use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::{Result, HTTP_MAX_LEN};

/// Pull callback filling a buffer with audio bytes; returning 0 ends
/// the reply body
pub type AudioDataProvider = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

/// Copy block size between the provider and the client socket
const COPY_BUFFER_SIZE: usize = 1024;

/// A small HTTP server which streams audio to each connected client.
///
/// Every request is answered with `200 OK`, the configured content
/// type and a body pulled from the data provider until it reports 0
/// bytes or the client disconnects. One client is served at a time;
/// further connections wait in the accept backlog.
pub struct HttpAudioServer {
    port: u16,
    content_type: String,
    provider: Arc<tokio::sync::Mutex<AudioDataProvider>>,
    listener: Option<Arc<TcpListener>>,
    local_port: u16,
    client_count: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    accept_task: Option<JoinHandle<()>>,
}

impl HttpAudioServer {
    pub fn new(provider: AudioDataProvider, content_type: &str, port: u16) -> Self {
        Self {
            port,
            content_type: content_type.to_string(),
            provider: Arc::new(tokio::sync::Mutex::new(provider)),
            listener: None,
            local_port: 0,
            client_count: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_task: None,
        }
    }

    /// Bind the listening socket; returns the actual local port
    pub async fn begin(&mut self) -> Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .map_err(|e| Error::Connect(format!("bind port {} failed: {}", self.port, e)))?;
        self.local_port = listener.local_addr()?.port();
        info!(port = self.local_port, "audio server listening");
        self.listener = Some(Arc::new(listener));
        Ok(self.local_port)
    }

    /// Serve clients on a background task
    pub fn run(&mut self) -> Result<()> {
        let Some(listener) = self.listener.clone() else {
            return Err(Error::InvalidState("server not bound, call begin".into()));
        };
        if self.accept_task.is_some() {
            return Ok(());
        }

        let provider = self.provider.clone();
        let content_type = self.content_type.clone();
        let client_count = self.client_count.clone();
        let shutdown = self.shutdown.clone();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                info!(%peer, "audio client connected");
                client_count.fetch_add(1, Ordering::SeqCst);
                let served = serve_client(socket, &content_type, &provider, &shutdown).await;
                client_count.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = served {
                    debug!("client ended: {}", e);
                }
            }
        }));
        Ok(())
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_client_connected(&self) -> bool {
        self.client_count.load(Ordering::SeqCst) > 0
    }

    /// Stop accepting and serving. Idempotent.
    pub async fn end(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.listener = None;
        info!("audio server stopped");
    }
}

impl Drop for HttpAudioServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn serve_client(
    socket: TcpStream,
    content_type: &str,
    provider: &Arc<tokio::sync::Mutex<AudioDataProvider>>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    socket.set_nodelay(true).ok();
    let mut stream = BufReader::new(socket);

    // consume the request header up to the blank line
    let mut line = Vec::with_capacity(128);
    let mut request_line = String::new();
    loop {
        line.clear();
        loop {
            if line.len() + 1 >= HTTP_MAX_LEN {
                break;
            }
            let mut byte = [0u8; 1];
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(Error::Protocol("client closed before request end".into()));
            }
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            break;
        }
        if request_line.is_empty() {
            request_line = text.to_string();
            info!(request = %request_line, "request");
        }
    }

    // reply header, then the streamed body
    let mut header = String::from("HTTP/1.1 200 OK\r\n");
    if !content_type.is_empty() {
        header.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    header.push_str("Connection: close\r\n\r\n");
    stream.write_all(header.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let n = {
            let mut provider = provider.lock().await;
            (*provider)(&mut buf)
        };
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        total += n as u64;
        // give slow sources a chance to refill
        if n < buf.len() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    stream.flush().await?;
    info!(total, "audio reply complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Method;
    use crate::url_stream::{UrlStream, UrlStreamConfig};

    fn counting_provider(limit: usize) -> AudioDataProvider {
        let mut produced = 0usize;
        Box::new(move |buf: &mut [u8]| {
            if produced >= limit {
                return 0;
            }
            let n = buf.len().min(limit - produced);
            for (i, slot) in buf.iter_mut().take(n).enumerate() {
                *slot = ((produced + i) % 251) as u8;
            }
            produced += n;
            n
        })
    }

    #[tokio::test]
    async fn test_streams_body_to_url_stream() {
        let mut server = HttpAudioServer::new(counting_provider(5000), "audio/pcm", 0);
        let port = server.begin().await.unwrap();
        server.run().unwrap();

        let mut cfg = UrlStreamConfig::default();
        cfg.timeout = Duration::from_secs(2);
        // no content length announced, so do not wait on `available`
        cfg.wait_for_data = false;
        let mut stream = UrlStream::new(cfg);
        let ok = stream
            .begin(
                &format!("http://127.0.0.1:{}/audio.pcm", port),
                None,
                Method::Get,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(
            stream.http_request().reply_header("Content-Type"),
            Some("audio/pcm")
        );

        let mut body = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = stream.read_bytes(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
        assert_eq!(body.len(), 5000);
        for (i, byte) in body.iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8);
        }

        server.end().await;
    }

    #[tokio::test]
    async fn test_serves_clients_in_sequence() {
        let mut server = HttpAudioServer::new(counting_provider(100), "audio/pcm", 0);
        let port = server.begin().await.unwrap();
        server.run().unwrap();

        for _ in 0..2 {
            let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            socket
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let mut reply = Vec::new();
            socket.read_to_end(&mut reply).await.unwrap();
            let text = String::from_utf8_lossy(&reply);
            assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        }
        // the provider is exhausted after the first client
        server.end().await;
    }
}
