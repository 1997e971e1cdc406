use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use audiocast_rtp_core::RtpStreamer;

use crate::message::{
    parse_request, response_describe, response_error, response_options, response_pause,
    response_play, response_setup, response_teardown, RtspMethod, RtspRequest,
};
use crate::sdp::build_sdp;
use crate::Result;

/// Streamer shared between the server, its sessions and the caller
pub type SharedStreamer = Arc<Mutex<RtpStreamer>>;

/// Buffer size for one incoming request
const REQUEST_BUFFER_SIZE: usize = 8192;

/// Lifecycle of an RTSP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Ready,
    Playing,
    Paused,
    Closed,
}

/// Callback deciding whether a requested stream path is served
pub type SessionPathCallback = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Handles the RTSP protocol for one connected client.
///
/// The session walks INIT -> READY -> PLAYING and is closed by
/// TEARDOWN, a disconnect or the server's idle timeout. Replies echo
/// the request CSeq; a SETUP binds the shared streamer's UDP transport
/// to the client's RTP port and PLAY/PAUSE start and stop the
/// periodic packetizer.
pub struct RtspSession<S> {
    stream: S,
    peer_ip: IpAddr,
    streamer: SharedStreamer,
    state: SessionState,
    session_id: String,
    client_rtp_port: u16,
    on_session_path: Option<SessionPathCallback>,
}

impl<S> RtspSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer_ip: IpAddr, streamer: SharedStreamer) -> Self {
        let session_id = rand::thread_rng().gen::<u16>().to_string();
        info!(%session_id, %peer_ip, "rtsp session created");
        Self {
            stream,
            peer_ip,
            streamer,
            state: SessionState::Init,
            session_id,
            client_rtp_port: 0,
            on_session_path: None,
        }
    }

    /// Restrict served paths; return false from the callback to answer 404
    pub fn set_on_session_path(&mut self, callback: SessionPathCallback) {
        self.on_session_path = Some(callback);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_open(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Playing
    }

    pub fn client_rtp_port(&self) -> u16 {
        self.client_rtp_port
    }

    /// Read and answer one request. Returns Ok(true) when a request
    /// was processed (or the peer disconnected), Ok(false) on a read
    /// timeout. Call repeatedly until the session is closed.
    pub async fn handle_requests(&mut self, read_timeout: Duration) -> Result<bool> {
        if self.state == SessionState::Closed {
            return Ok(false);
        }

        let Some(request_text) = self.read_request(read_timeout).await? else {
            return Ok(false);
        };
        if request_text.is_empty() {
            warn!("client closed socket, exiting");
            self.close().await;
            return Ok(true);
        }

        // everything that does not look like an RTSP command is dropped
        let request = match parse_request(&request_text) {
            Ok(request) => request,
            Err(e) => {
                warn!("ignoring request: {}", e);
                return Ok(true);
            }
        };
        debug!(method = request.method.as_str(), cseq = %request.cseq, "rtsp request");

        match request.method {
            RtspMethod::Options => self.handle_options(&request).await?,
            RtspMethod::Describe => self.handle_describe(&request).await?,
            RtspMethod::Setup => self.handle_setup(&request).await?,
            RtspMethod::Play => self.handle_play(&request).await?,
            RtspMethod::Pause => self.handle_pause(&request).await?,
            RtspMethod::Teardown => self.handle_teardown(&request).await?,
        }
        Ok(true)
    }

    /// Stop streaming, release the transport and mark the session
    /// closed. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let mut streamer = self.streamer.lock().await;
        streamer.stop();
        streamer.release_udp_transport();
        self.state = SessionState::Closed;
        info!(session_id = %self.session_id, "rtsp session closed");
    }

    // OPTIONS is answered in any state
    async fn handle_options(&mut self, request: &RtspRequest) -> Result<()> {
        self.send(&response_options(&request.cseq)).await
    }

    async fn handle_describe(&mut self, request: &RtspRequest) -> Result<()> {
        if let Some(callback) = &self.on_session_path {
            if !callback(&request.path) {
                let reply = response_error(&request.cseq, 404, "Not Found");
                return self.send(&reply).await;
            }
        }
        let host = request
            .host_port
            .split(':')
            .next()
            .unwrap_or(&request.host_port)
            .to_string();
        let sdp = {
            let streamer = self.streamer.lock().await;
            build_sdp(streamer.format(), &host)
        };
        let reply = response_describe(&request.cseq, &request.host_port, &sdp);
        self.send(&reply).await
    }

    async fn handle_setup(&mut self, request: &RtspRequest) -> Result<()> {
        let Some(client_rtp_port) = request.client_rtp_port else {
            let reply = response_error(&request.cseq, 461, "Unsupported Transport");
            return self.send(&reply).await;
        };

        let (server_rtp_port, server_rtcp_port) = {
            let mut streamer = self.streamer.lock().await;
            streamer
                .init_udp_transport(self.peer_ip, client_rtp_port)
                .await?;
            (streamer.rtp_server_port(), streamer.rtcp_server_port())
        };

        self.client_rtp_port = client_rtp_port;
        self.state = SessionState::Ready;
        info!(
            client_rtp_port,
            server_rtp_port, "transport set up"
        );

        let destination = self.peer_ip.to_string();
        let reply = response_setup(
            &request.cseq,
            &self.session_id,
            &destination,
            "127.0.0.1",
            client_rtp_port,
            client_rtp_port + 1,
            server_rtp_port,
            server_rtcp_port,
        );
        self.send(&reply).await
    }

    async fn handle_play(&mut self, request: &RtspRequest) -> Result<()> {
        if !self.session_matches(request) {
            let reply = response_error(&request.cseq, 454, "Session Not Found");
            return self.send(&reply).await;
        }
        if self.state == SessionState::Init {
            let reply = response_error(&request.cseq, 455, "Method Not Valid in This State");
            return self.send(&reply).await;
        }

        let reply = response_play(&request.cseq, &self.session_id);
        self.send(&reply).await?;

        self.streamer.lock().await.start()?;
        self.state = SessionState::Playing;
        Ok(())
    }

    async fn handle_pause(&mut self, request: &RtspRequest) -> Result<()> {
        if !self.session_matches(request) {
            let reply = response_error(&request.cseq, 454, "Session Not Found");
            return self.send(&reply).await;
        }
        if self.state == SessionState::Playing {
            self.streamer.lock().await.stop();
            self.state = SessionState::Paused;
        }
        let reply = response_pause(&request.cseq, &self.session_id);
        self.send(&reply).await
    }

    async fn handle_teardown(&mut self, request: &RtspRequest) -> Result<()> {
        if !self.session_matches(request) {
            let reply = response_error(&request.cseq, 454, "Session Not Found");
            return self.send(&reply).await;
        }
        let reply = response_teardown(&request.cseq);
        self.send(&reply).await?;
        self.close().await;
        Ok(())
    }

    fn session_matches(&self, request: &RtspRequest) -> bool {
        request.session.as_deref() == Some(self.session_id.as_str())
    }

    async fn send(&mut self, reply: &str) -> Result<()> {
        self.stream.write_all(reply.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    // Read one request up to the header terminator. Returns None on a
    // read timeout, Some("") when the peer disconnected.
    async fn read_request(&mut self, read_timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + read_timeout;
        let mut data: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let read = timeout(deadline - now, self.stream.read(&mut chunk)).await;
            match read {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(0)) => return Ok(Some(String::new())),
                Ok(Ok(n)) => {
                    data.extend_from_slice(&chunk[..n]);
                    if data.len() > REQUEST_BUFFER_SIZE {
                        return Err(crate::Error::Protocol("request too large".into()));
                    }
                    if data.windows(4).any(|w| w == b"\r\n\r\n") {
                        return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiocast_rtp_core::{PcmBufferSource, RtpAudioFormat};
    use std::net::Ipv4Addr;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_streamer() -> SharedStreamer {
        let mut format = RtpAudioFormat::l16(44_100, 2);
        format.set_fragment_size(1764);
        let source = PcmBufferSource::new(format, vec![0u8; 176_400]).with_looping();
        Arc::new(Mutex::new(RtpStreamer::new(Box::new(source))))
    }

    async fn exchange(
        session: &mut RtspSession<DuplexStream>,
        client: &mut DuplexStream,
        request: &str,
    ) -> String {
        client.write_all(request.as_bytes()).await.unwrap();
        let handled = session
            .handle_requests(Duration::from_millis(500))
            .await
            .unwrap();
        assert!(handled);
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_options_echoes_cseq() {
        let (mut client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());

        let reply = exchange(
            &mut session,
            &mut client,
            "OPTIONS rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 1\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(reply.contains("CSeq: 1\r\n"));
        assert!(reply.contains("Public: DESCRIBE, SETUP, TEARDOWN, PLAY"));
    }

    #[tokio::test]
    async fn test_describe_l16_stereo_sdp() {
        let (mut client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());

        let reply = exchange(
            &mut session,
            &mut client,
            "DESCRIBE rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(reply.contains("CSeq: 2\r\n"));
        assert!(reply.contains("Content-Type: application/sdp\r\n"));
        assert!(reply.contains("m=audio 0 RTP/AVP 10\r\n"));
        assert!(reply.contains("a=rtpmap:10 L16/44100/2\r\n"));
        assert!(reply.contains("a=control:trackID=0"));
    }

    #[tokio::test]
    async fn test_setup_play_teardown_lifecycle() {
        let (mut client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());
        assert_eq!(session.state(), SessionState::Init);

        let reply = exchange(
            &mut session,
            &mut client,
            "SETUP rtsp://127.0.0.1:8554/trackID=0 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n",
        )
        .await;
        assert!(reply.contains("CSeq: 3\r\n"));
        assert!(reply.contains(&format!("Session: {}\r\n", session.session_id())));
        assert!(reply.contains("client_port=5000-5001"));
        assert!(reply.contains("server_port="));
        assert_eq!(session.state(), SessionState::Ready);

        let play = format!(
            "PLAY rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n",
            session.session_id()
        );
        let reply = exchange(&mut session, &mut client, &play).await;
        assert!(reply.contains("CSeq: 4\r\n"));
        assert!(reply.contains("Range: npt=0.000-\r\n"));
        assert_eq!(session.state(), SessionState::Playing);

        let teardown = format!(
            "TEARDOWN rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 5\r\nSession: {}\r\n\r\n",
            session.session_id()
        );
        let reply = exchange(&mut session, &mut client, &teardown).await;
        assert!(reply.contains("CSeq: 5\r\n"));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_play_with_wrong_session_is_rejected() {
        let (mut client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());

        let reply = exchange(
            &mut session,
            &mut client,
            "SETUP rtsp://127.0.0.1:8554/trackID=0 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n",
        )
        .await;
        assert!(reply.contains("200 OK"));

        let reply = exchange(
            &mut session,
            &mut client,
            "PLAY rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 2\r\nSession: 99999999\r\n\r\n",
        )
        .await;
        assert!(reply.contains("454"));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_play_before_setup_is_rejected() {
        let (mut client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());

        let play = format!(
            "PLAY rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 1\r\nSession: {}\r\n\r\n",
            session.session_id()
        );
        let reply = exchange(&mut session, &mut client, &play).await;
        assert!(reply.contains("455"));
        assert_eq!(session.state(), SessionState::Init);
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_session_open() {
        let (mut client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());

        client
            .write_all(b"ANNOUNCE rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        let handled = session
            .handle_requests(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(handled);
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_read_timeout_returns_false() {
        let (_client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());
        let handled = session
            .handle_requests(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!handled);
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let (client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());
        drop(client);
        let handled = session
            .handle_requests(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(handled);
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_session_path_callback_rejects() {
        let (mut client, server) = duplex(16384);
        let mut session =
            RtspSession::new(server, IpAddr::V4(Ipv4Addr::LOCALHOST), test_streamer());
        session.set_on_session_path(Box::new(|path| path.starts_with("studio")));

        let reply = exchange(
            &mut session,
            &mut client,
            "DESCRIBE rtsp://127.0.0.1:8554/garage RTSP/1.0\r\nCSeq: 2\r\n\r\n",
        )
        .await;
        assert!(reply.contains("404"));

        let reply = exchange(
            &mut session,
            &mut client,
            "DESCRIBE rtsp://127.0.0.1:8554/studio RTSP/1.0\r\nCSeq: 3\r\n\r\n",
        )
        .await;
        assert!(reply.contains("200 OK"));
    }
}
