use tracing::{debug, warn};

use crate::connection::HttpConnection;
use crate::header::ReplyHeader;
use crate::{Result, HTTP_CHUNKED_SIZE_MAX_LEN};

/// Decoder for `Transfer-Encoding: chunked` reply bodies.
///
/// Each chunk is announced by a hex length line; the data is followed
/// by CRLF and the next length line. A zero length ends the body, after
/// which any trailing headers are parsed into the reply header and
/// discarded for the caller.
#[derive(Debug, Default)]
pub struct ChunkReader {
    open_chunk_len: usize,
    has_ended: bool,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self {
            open_chunk_len: 0,
            has_ended: false,
        }
    }

    /// Read the length of the first chunk; called once after the reply
    /// header announced a chunked body
    pub async fn open(&mut self, conn: &mut HttpConnection, reply: &mut ReplyHeader) -> Result<()> {
        self.has_ended = false;
        self.open_chunk_len = 0;
        self.read_chunk_len(conn, reply).await
    }

    /// Read a block of data out of the chunks, at most one chunk at a time
    pub async fn read(
        &mut self,
        conn: &mut HttpConnection,
        reply: &mut ReplyHeader,
        buf: &mut [u8],
    ) -> Result<usize> {
        if (self.has_ended && self.open_chunk_len == 0) || buf.is_empty() {
            return Ok(0);
        }

        let read_max = buf.len().min(self.open_chunk_len);
        let n = conn.read(&mut buf[..read_max]).await?;
        self.open_chunk_len -= n;

        if self.open_chunk_len == 0 && !self.has_ended {
            self.remove_crlf(conn).await?;
            self.read_chunk_len(conn, reply).await?;
        }

        Ok(n)
    }

    /// Bytes remaining in the current chunk, 0 once the body has ended
    pub fn available(&self) -> usize {
        if self.has_ended {
            0
        } else {
            self.open_chunk_len
        }
    }

    pub fn has_ended(&self) -> bool {
        self.has_ended
    }

    async fn remove_crlf(&mut self, conn: &mut HttpConnection) -> Result<()> {
        if conn.peek().await? == Some(b'\r') {
            conn.consume(1);
        }
        if conn.peek().await? == Some(b'\n') {
            conn.consume(1);
        }
        Ok(())
    }

    // the chunk length is indicated as a hex value on its own line
    async fn read_chunk_len(
        &mut self,
        conn: &mut HttpConnection,
        reply: &mut ReplyHeader,
    ) -> Result<()> {
        let line = conn
            .read_line(HTTP_CHUNKED_SIZE_MAX_LEN + 2, false)
            .await?;
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        self.open_chunk_len = match usize::from_str_radix(text, 16) {
            Ok(len) => len,
            Err(_) => {
                warn!(line = %text, "invalid chunk length");
                0
            }
        };
        debug!(chunk_len = self.open_chunk_len, "next chunk");

        if self.open_chunk_len == 0 {
            self.has_ended = true;
            debug!("last chunk received");
            // trailing headers after the final chunk
            reply.read_trailers(conn).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn read_all(
        reader: &mut ChunkReader,
        conn: &mut HttpConnection,
        reply: &mut ReplyHeader,
        step: usize,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; step];
        loop {
            let n = reader.read(conn, reply, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_two_chunks() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = HttpConnection::from_stream(Box::new(client), Duration::from_secs(1));
        let mut reply = ReplyHeader::new();

        server
            .write_all(b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n")
            .await
            .unwrap();

        let mut reader = ChunkReader::new();
        reader.open(&mut conn, &mut reply).await.unwrap();
        let body = read_all(&mut reader, &mut conn, &mut reply, 64).await;
        assert_eq!(body, b"Hello World");
        assert!(reader.has_ended());
        assert_eq!(reader.available(), 0);
    }

    #[tokio::test]
    async fn test_small_read_sizes_reassemble() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = HttpConnection::from_stream(Box::new(client), Duration::from_secs(1));
        let mut reply = ReplyHeader::new();

        server
            .write_all(b"3\r\nabc\r\nA\r\n0123456789\r\n0\r\n\r\n")
            .await
            .unwrap();

        let mut reader = ChunkReader::new();
        reader.open(&mut conn, &mut reply).await.unwrap();
        // one byte at a time must yield the same concatenation
        let body = read_all(&mut reader, &mut conn, &mut reply, 1).await;
        assert_eq!(body, b"abc0123456789");
    }

    #[tokio::test]
    async fn test_trailing_headers_parsed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = HttpConnection::from_stream(Box::new(client), Duration::from_secs(1));
        let mut reply = ReplyHeader::new();

        server
            .write_all(b"4\r\ndata\r\n0\r\nX-Check: done\r\n\r\n")
            .await
            .unwrap();

        let mut reader = ChunkReader::new();
        reader.open(&mut conn, &mut reply).await.unwrap();
        let body = read_all(&mut reader, &mut conn, &mut reply, 16).await;
        assert_eq!(body, b"data");
        assert_eq!(reply.header.get("X-Check"), Some("done"));
    }

    #[tokio::test]
    async fn test_invalid_length_ends_body() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = HttpConnection::from_stream(Box::new(client), Duration::from_secs(1));
        let mut reply = ReplyHeader::new();

        server.write_all(b"zz\r\n\r\n").await.unwrap();

        let mut reader = ChunkReader::new();
        reader.open(&mut conn, &mut reply).await.unwrap();
        let mut buf = [0u8; 8];
        let n = reader.read(&mut conn, &mut reply, &mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(reader.has_ended());
    }
}
