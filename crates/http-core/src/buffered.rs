use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::header::Method;
use crate::url_stream::{UrlStream, UrlStreamConfig};
use crate::Result;

/// Chunk size the prefetch task reads from the network
const PREFETCH_CHUNK_SIZE: usize = 512;

/// Number of chunks buffered ahead of the consumer
const PREFETCH_DEPTH: usize = 20;

/// A [`UrlStream`] whose body is prefetched by a background task.
///
/// The task keeps reading from the network into a bounded queue while
/// the consumer drains it, smoothing over jittery servers so the audio
/// pipeline never starves on a slow read.
pub struct BufferedUrlStream {
    cfg: UrlStreamConfig,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    leftover: Vec<u8>,
    leftover_pos: usize,
    total_read: u64,
    content_length: Option<usize>,
    active: bool,
}

impl Default for BufferedUrlStream {
    fn default() -> Self {
        Self::new(UrlStreamConfig::default())
    }
}

impl BufferedUrlStream {
    pub fn new(cfg: UrlStreamConfig) -> Self {
        Self {
            cfg,
            rx: None,
            task: None,
            leftover: Vec::new(),
            leftover_pos: 0,
            total_read: 0,
            content_length: None,
            active: false,
        }
    }

    /// Issue the request and start the prefetch task
    pub async fn begin(&mut self, url: &str, accept_mime: Option<&str>) -> Result<bool> {
        self.end().await;

        let mut stream = UrlStream::new(self.cfg.clone());
        let ok = stream.begin(url, accept_mime, Method::Get, None, None).await?;
        if !ok {
            return Ok(false);
        }
        self.content_length = stream.content_length();

        let (tx, rx) = mpsc::channel::<Vec<u8>>(PREFETCH_DEPTH);
        self.rx = Some(rx);
        self.task = Some(tokio::spawn(async move {
            let mut buf = [0u8; PREFETCH_CHUNK_SIZE];
            loop {
                let n = match stream.read_bytes(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("prefetch read failed: {}", e);
                        break;
                    }
                };
                if n == 0 {
                    debug!("prefetch reached end of stream");
                    break;
                }
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    // consumer is gone
                    break;
                }
            }
            stream.end().await;
        }));

        self.total_read = 0;
        self.active = true;
        Ok(true)
    }

    /// Read body bytes, waiting on the prefetch queue when empty.
    /// Returns 0 once the stream has ended.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.active || buf.is_empty() {
            return Ok(0);
        }
        if self.leftover_pos >= self.leftover.len() {
            let Some(rx) = self.rx.as_mut() else {
                return Ok(0);
            };
            match rx.recv().await {
                Some(chunk) => {
                    self.leftover = chunk;
                    self.leftover_pos = 0;
                }
                None => {
                    self.active = false;
                    return Ok(0);
                }
            }
        }
        let n = (self.leftover.len() - self.leftover_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[self.leftover_pos..self.leftover_pos + n]);
        self.leftover_pos += n;
        self.total_read += n as u64;
        Ok(n)
    }

    /// Bytes immediately available from the local queue
    pub fn available(&self) -> usize {
        self.leftover.len() - self.leftover_pos
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Stop the prefetch task and drop buffered data. Idempotent.
    pub async fn end(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx = None;
        self.leftover.clear();
        self.leftover_pos = 0;
        self.active = false;
    }
}

impl Drop for BufferedUrlStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
