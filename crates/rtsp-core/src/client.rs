use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use audiocast_media_core::{
    shared_sink, AudioDecoder, DecoderRegistry, L8Decoder, NetworkOrderDecoder, Resampler,
    SharedPcmSink,
};
use audiocast_rtp_core::RTP_MIN_HEADER_SIZE;

use crate::message::{header_value, parse_status_line};
use crate::sdp::SdpInfo;
use crate::{Error, Result, CLIENT_RTP_PORT_SCAN_START, KEEPALIVE_INTERVAL_MS};

/// Configuration for an [`RtspClient`]
#[derive(Debug, Clone)]
pub struct RtspClientConfig {
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    /// Timeout for reading RTSP response headers
    pub header_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Backoff when no payload is available
    pub idle_delay: Duration,
    /// Extra bytes between the RTP header (plus CSRCs) and the audio
    /// payload, e.g. 4 for the RFC 2250 MPEG audio header
    pub payload_offset: usize,
    /// Initial resample factor for drift compensation
    pub resample_factor: f32,
}

impl Default for RtspClientConfig {
    fn default() -> Self {
        Self {
            connect_retries: 2,
            connect_retry_delay: Duration::from_millis(500),
            header_timeout: Duration::from_millis(4_000),
            keepalive_interval: Duration::from_millis(KEEPALIVE_INTERVAL_MS),
            idle_delay: Duration::from_millis(10),
            payload_offset: 0,
            resample_factor: 1.0,
        }
    }
}

/// RTSP client for UDP/RTP audio with a decoder pipeline.
///
/// `begin` runs the handshake (OPTIONS, DESCRIBE, SETUP with UDP
/// transport, PLAY), binds a local even RTP port and then delivers the
/// payload of each received RTP packet to the decoder registered for
/// the negotiated MIME type. L16 payloads pass through a network order
/// decoder and L8 payloads through an 8 to 16 bit expander; both feed
/// a resampler whose factor can compensate sender clock drift. Drive
/// the receive path by calling [`copy`](Self::copy) in a loop.
pub struct RtspClient {
    cfg: RtspClientConfig,
    tcp: Option<BufReader<TcpStream>>,
    udp: Option<UdpSocket>,
    rtcp: Option<UdpSocket>,
    addr: Option<IpAddr>,
    port: u16,
    cseq: u32,
    base_url: String,
    track_url: String,
    content_base: String,
    session_id: String,
    sdp: SdpInfo,
    client_rtp_port: u16,
    server_rtp_port: u16,
    started: bool,
    playing: bool,
    last_keepalive: Instant,
    registry: DecoderRegistry,
    resampler: Arc<Mutex<Resampler>>,
    decoder_ready: bool,
    pending_packet: Option<Vec<u8>>,
    recv_buf: Vec<u8>,
}

impl RtspClient {
    /// Create a client delivering decoded audio to `output`
    pub fn new<F>(output: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        Self::with_config(output, RtspClientConfig::default())
    }

    pub fn with_config<F>(output: F, cfg: RtspClientConfig) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let resampler = Arc::new(Mutex::new(Resampler::new(shared_sink(output), 2)));
        resampler.lock().set_factor(cfg.resample_factor);

        // raw PCM payload decoders route through the shared resampler
        let resampler_sink: SharedPcmSink = {
            let resampler = resampler.clone();
            shared_sink(move |data: &[u8]| {
                resampler.lock().write(data);
            })
        };
        let mut registry = DecoderRegistry::new();
        registry.add_decoder(
            "audio/L16",
            Box::new(NetworkOrderDecoder::new(resampler_sink.clone())),
        );
        registry.add_decoder("audio/L8", Box::new(L8Decoder::new(resampler_sink)));

        Self {
            cfg,
            tcp: None,
            udp: None,
            rtcp: None,
            addr: None,
            port: 0,
            cseq: 1,
            base_url: String::new(),
            track_url: String::new(),
            content_base: String::new(),
            session_id: String::new(),
            sdp: SdpInfo::default(),
            client_rtp_port: 0,
            server_rtp_port: 0,
            started: false,
            playing: false,
            last_keepalive: Instant::now(),
            registry,
            resampler,
            decoder_ready: false,
            pending_packet: None,
            recv_buf: vec![0u8; 4096],
        }
    }

    /// Register a decoder for a MIME type, e.g. an MP3 decoder for
    /// `audio/mpeg`
    pub fn add_decoder(&mut self, mime: &str, decoder: Box<dyn AudioDecoder>) {
        self.registry.add_decoder(mime, decoder);
    }

    /// Resample factor for drift compensation; 1.0 is pass-through
    pub fn set_resample_factor(&mut self, factor: f32) {
        self.resampler.lock().set_factor(factor);
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Payload type negotiated via SDP (or seen on the wire)
    pub fn payload_type(&self) -> Option<u8> {
        self.sdp.payload_type
    }

    /// MIME of the negotiated payload
    pub fn mime(&self) -> Result<&'static str> {
        self.sdp.mime()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Start the RTSP session and the UDP RTP reception.
    ///
    /// `path` is appended to the base URL; the SETUP target comes from
    /// the SDP `a=control:` attribute (default `trackID=0`).
    pub async fn begin(&mut self, addr: IpAddr, port: u16, path: Option<&str>) -> Result<()> {
        self.reset_state();
        self.addr = Some(addr);
        self.port = port;

        self.connect_tcp(addr, port).await?;
        self.build_urls(path);

        // OPTIONS, retried like the TCP connect
        info!("OPTIONS");
        let mut retries = self.cfg.connect_retries + 1;
        loop {
            let base = self.base_url.clone();
            match self.send_request("OPTIONS", &base, None, false, false).await {
                Ok(_) => break,
                Err(e) => {
                    retries -= 1;
                    if retries == 0 {
                        return self.fail("OPTIONS failed", e).await;
                    }
                    warn!("retrying OPTIONS");
                    sleep(Duration::from_millis(800)).await;
                }
            }
        }

        // DESCRIBE and SDP evaluation
        info!("DESCRIBE");
        let base = self.base_url.clone();
        let (headers, body) = match self
            .send_request(
                "DESCRIBE",
                &base,
                Some("Accept: application/sdp\r\n"),
                true,
                false,
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => return self.fail("DESCRIBE failed", e).await,
        };
        let sdp_body = body.unwrap_or_default();
        self.sdp = SdpInfo::parse(&sdp_body);
        if self.sdp.channels > 0 {
            self.resampler.lock().set_channels(self.sdp.channels as usize);
        }
        self.content_base = header_value(&headers, "Content-Base")
            .map(|mut base| {
                if !base.ends_with('/') {
                    base.push('/');
                }
                base
            })
            .unwrap_or_default();
        self.build_track_url();
        info!(
            control = self.sdp.control.as_deref().unwrap_or(""),
            content_base = %self.content_base,
            track_url = %self.track_url,
            "sdp evaluated"
        );

        if let Err(e) = self.open_udp_ports().await {
            return self.fail("UDP bind failed", e).await;
        }

        // SETUP; some servers require the explicit UDP transport profile
        info!("SETUP {}", self.track_url);
        let transport = format!(
            "Transport: RTP/AVP;unicast;client_port={}-{}\r\n",
            self.client_rtp_port,
            self.client_rtp_port + 1
        );
        let track = self.track_url.clone();
        let headers = match self
            .send_request("SETUP", &track, Some(&transport), false, false)
            .await
        {
            Ok((headers, _)) => headers,
            Err(_) => {
                let transport = format!(
                    "Transport: RTP/AVP/UDP;unicast;client_port={}-{}\r\n",
                    self.client_rtp_port,
                    self.client_rtp_port + 1
                );
                match self
                    .send_request("SETUP", &track, Some(&transport), false, false)
                    .await
                {
                    Ok((headers, _)) => headers,
                    Err(e) => return self.fail("SETUP failed", e).await,
                }
            }
        };
        self.parse_session(&headers);
        self.parse_server_ports(&headers);
        if self.session_id.is_empty() {
            return self
                .fail("missing session id", Error::Protocol("no Session header".into()))
                .await;
        }

        self.prime_udp_path().await;

        // PLAY; tolerate a missing reply when RTP already flows
        info!("PLAY");
        let session_header = format!("Session: {}\r\n", self.session_id);
        let base = self.base_url.clone();
        if let Err(e) = self
            .send_request("PLAY", &base, Some(&session_header), false, false)
            .await
        {
            if self.sniff_udp(Duration::from_millis(1_500)).await {
                warn!("proceeding without PLAY response (RTP detected)");
            } else {
                return self.fail("PLAY failed", e).await;
            }
        }

        self.started = true;
        self.playing = true;
        self.last_keepalive = Instant::now();
        Ok(())
    }

    /// Pause or resume playback via RTSP PAUSE/PLAY
    pub async fn set_active(&mut self, active: bool) -> Result<()> {
        if !self.started || self.session_id.is_empty() {
            return Err(Error::InvalidState("session not established".into()));
        }
        if active == self.playing {
            return Ok(());
        }
        let session_header = format!("Session: {}\r\n", self.session_id);
        let base = self.base_url.clone();
        if active {
            self.send_request("PLAY", &base, Some(&session_header), false, false)
                .await?;
            self.playing = true;
        } else {
            self.send_request("PAUSE", &base, Some(&session_header), false, false)
                .await?;
            self.playing = false;
            // drop any buffered payload
            self.pending_packet = None;
        }
        Ok(())
    }

    /// Receive the next RTP packet (if any) and push its payload into
    /// the decoder pipeline. Returns the bytes handed to the decoder;
    /// sleeps the idle delay when there was nothing to do.
    pub async fn copy(&mut self) -> usize {
        if !self.started {
            sleep(self.cfg.idle_delay).await;
            return 0;
        }
        self.maybe_keepalive().await;
        if !self.playing {
            sleep(self.cfg.idle_delay).await;
            return 0;
        }
        let written = self.service_udp();
        if written == 0 {
            sleep(self.cfg.idle_delay).await;
        }
        written
    }

    /// Best-effort TEARDOWN, then close all sockets. Idempotent.
    pub async fn end(&mut self) {
        if self.started && !self.session_id.is_empty() && self.tcp.is_some() {
            let session_header = format!("Session: {}\r\n", self.session_id);
            let base = self.base_url.clone();
            let _ = self
                .send_request("TEARDOWN", &base, Some(&session_header), false, true)
                .await;
        }
        self.tcp = None;
        self.udp = None;
        self.rtcp = None;
        self.started = false;
        self.playing = false;
        self.registry.end();
    }

    // pull one UDP packet and demux its payload
    fn service_udp(&mut self) -> usize {
        let packet_len = if let Some(pending) = self.pending_packet.take() {
            let n = pending.len().min(self.recv_buf.len());
            self.recv_buf[..n].copy_from_slice(&pending[..n]);
            n
        } else {
            let Some(udp) = &self.udp else {
                return 0;
            };
            match udp.try_recv_from(&mut self.recv_buf) {
                Ok((n, _)) => n,
                Err(_) => return 0,
            }
        };

        if packet_len <= RTP_MIN_HEADER_SIZE {
            debug!(packet_len, "packet too small for RTP");
            return 0;
        }

        // payload offset: fixed header, CSRC entries, configured extra
        let csrc_count = (self.recv_buf[0] & 0x0F) as usize;
        let offset = RTP_MIN_HEADER_SIZE + csrc_count * 4 + self.cfg.payload_offset;
        if offset >= packet_len {
            warn!(packet_len, offset, "rtp packet without payload");
            return 0;
        }

        // first payload: settle the decoder selection
        if !self.decoder_ready {
            if self.sdp.payload_type.is_none() {
                self.sdp.payload_type = Some(self.recv_buf[1] & 0x7F);
            }
            match self.sdp.mime() {
                Ok(mime) => match self.registry.select(mime) {
                    Ok(()) => self.decoder_ready = true,
                    Err(e) => {
                        warn!("no decoder: {}", e);
                        return 0;
                    }
                },
                Err(e) => {
                    warn!("cannot derive mime: {}", e);
                    return 0;
                }
            }
        }

        self.registry.write(&self.recv_buf[offset..packet_len])
    }

    async fn maybe_keepalive(&mut self) {
        if !self.started || self.tcp.is_none() {
            return;
        }
        if self.last_keepalive.elapsed() < self.cfg.keepalive_interval {
            return;
        }
        self.last_keepalive = Instant::now();
        let extra = if self.session_id.is_empty() {
            None
        } else {
            Some(format!("Session: {}\r\n", self.session_id))
        };
        let base = self.base_url.clone();
        if let Err(e) = self
            .send_request("OPTIONS", &base, extra.as_deref(), false, true)
            .await
        {
            debug!("keepalive failed: {}", e);
        }
    }

    async fn connect_tcp(&mut self, addr: IpAddr, port: u16) -> Result<()> {
        info!(%addr, port, "connecting");
        let mut stream = None;
        for attempt in 0..=self.cfg.connect_retries {
            match timeout(self.cfg.header_timeout, TcpStream::connect((addr, port))).await {
                Ok(Ok(socket)) => {
                    stream = Some(socket);
                    break;
                }
                _ => {
                    warn!(attempt = attempt + 1, "connect attempt failed");
                    if attempt < self.cfg.connect_retries {
                        sleep(self.cfg.connect_retry_delay).await;
                    }
                }
            }
        }
        let Some(socket) = stream else {
            return Err(Error::Connect(format!(
                "TCP connect to {}:{} failed",
                addr, port
            )));
        };
        socket.set_nodelay(true).ok();
        self.tcp = Some(BufReader::new(socket));
        Ok(())
    }

    fn build_urls(&mut self, path: Option<&str>) {
        let addr = self.addr.map(|a| a.to_string()).unwrap_or_default();
        self.base_url = format!("rtsp://{}:{}/", addr, self.port);
        if let Some(path) = path {
            let path = path.trim_start_matches('/');
            if !path.is_empty() {
                self.base_url.push_str(path);
                if !self.base_url.ends_with('/') {
                    self.base_url.push('/');
                }
            }
        }
        self.track_url = format!("{}trackID=0", self.base_url);
    }

    fn build_track_url(&mut self) {
        match self.sdp.control.clone() {
            None => self.track_url = format!("{}trackID=0", self.base_url),
            Some(control)
                if control.to_ascii_lowercase().starts_with("rtsp://")
                    || control.to_ascii_lowercase().starts_with("rtsps://") =>
            {
                self.track_url = control;
            }
            Some(control) => {
                let base = if self.content_base.is_empty() {
                    &self.base_url
                } else {
                    &self.content_base
                };
                let mut track = base.clone();
                if !track.ends_with('/') {
                    track.push('/');
                }
                track.push_str(control.trim_start_matches('/'));
                self.track_url = track;
            }
        }
    }

    // try a few even RTP ports starting at 5004, the odd port above is
    // reserved for RTCP
    async fn open_udp_ports(&mut self) -> Result<()> {
        let mut port = CLIENT_RTP_PORT_SCAN_START;
        while port < 65_000 {
            if let Ok(rtp) = UdpSocket::bind(("0.0.0.0", port)).await {
                if let Ok(rtcp) = UdpSocket::bind(("0.0.0.0", port + 1)).await {
                    info!(port, "bound UDP RTP port");
                    self.udp = Some(rtp);
                    self.rtcp = Some(rtcp);
                    self.client_rtp_port = port;
                    return Ok(());
                }
            }
            port += 2;
        }
        Err(Error::ResourceExhausted(
            "no even UDP port for RTP reception".into(),
        ))
    }

    // two empty datagrams towards the server RTP port open NAT bindings
    async fn prime_udp_path(&mut self) {
        let (Some(udp), Some(addr)) = (&self.udp, self.addr) else {
            return;
        };
        if self.server_rtp_port == 0 {
            return;
        }
        for _ in 0..2 {
            let _ = udp.send_to(&[], (addr, self.server_rtp_port)).await;
            sleep(Duration::from_millis(2)).await;
        }
    }

    async fn sniff_udp(&mut self, duration: Duration) -> bool {
        let Some(udp) = &self.udp else {
            return false;
        };
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            match udp.try_recv_from(&mut self.recv_buf) {
                Ok((n, _)) => {
                    self.pending_packet = Some(self.recv_buf[..n].to_vec());
                    return true;
                }
                Err(_) => sleep(Duration::from_millis(5)).await,
            }
        }
        false
    }

    fn parse_session(&mut self, headers: &str) {
        if let Some(session) = header_value(headers, "Session") {
            self.session_id = session
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
        }
    }

    fn parse_server_ports(&mut self, headers: &str) {
        let Some(transport) = header_value(headers, "Transport") else {
            return;
        };
        let Some(start) = transport.find("server_port=") else {
            return;
        };
        let ports = &transport[start + "server_port=".len()..];
        if let Some(first) = ports.split(|c: char| c == '-' || c == ';').next() {
            if let Ok(port) = first.parse() {
                self.server_rtp_port = port;
            }
        }
    }

    async fn send_request(
        &mut self,
        method: &str,
        url: &str,
        extra_headers: Option<&str>,
        want_body: bool,
        quiet: bool,
    ) -> Result<(String, Option<String>)> {
        let header_timeout = self.cfg.header_timeout;
        let cseq = self.cseq;
        self.cseq += 1;

        let tcp = self
            .tcp
            .as_mut()
            .ok_or_else(|| Error::InvalidState("not connected".into()))?;
        let request = format!(
            "{} {} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: audiocast\r\n{}\r\n",
            method,
            url,
            cseq,
            extra_headers.unwrap_or("")
        );
        tcp.write_all(request.as_bytes()).await?;
        tcp.flush().await?;

        let headers = read_headers(tcp, header_timeout).await?;
        let status_line = headers.lines().next().unwrap_or("");
        let (code, _reason) = parse_status_line(status_line)?;
        if !(200..300).contains(&code) {
            if !quiet {
                warn!(code, method, "request rejected");
            }
            return Err(Error::Status(code));
        }

        let body = if want_body {
            let content_length = header_value(&headers, "Content-Length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if content_length > 0 {
                let mut body = vec![0u8; content_length];
                timeout(header_timeout, tcp.read_exact(&mut body))
                    .await
                    .map_err(|_| Error::Timeout(header_timeout.as_millis() as u64))??;
                Some(String::from_utf8_lossy(&body).into_owned())
            } else {
                None
            }
        } else {
            None
        };

        Ok((headers, body))
    }

    async fn fail(&mut self, message: &str, source: Error) -> Result<()> {
        warn!("{}: {}", message, source);
        self.end().await;
        Err(source)
    }

    fn reset_state(&mut self) {
        self.cseq = 1;
        self.session_id.clear();
        self.content_base.clear();
        self.sdp = SdpInfo::default();
        self.client_rtp_port = 0;
        self.server_rtp_port = 0;
        self.started = false;
        self.playing = false;
        self.decoder_ready = false;
        self.pending_packet = None;
        self.tcp = None;
        self.udp = None;
        self.rtcp = None;
    }
}

// read response bytes until the blank line terminating the headers
async fn read_headers(tcp: &mut BufReader<TcpStream>, dur: Duration) -> Result<String> {
    let deadline = Instant::now() + dur;
    let mut out: Vec<u8> = Vec::new();
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(dur.as_millis() as u64));
        }
        let mut byte = [0u8; 1];
        let read = timeout(deadline - now, tcp.read(&mut byte))
            .await
            .map_err(|_| Error::Timeout(dur.as_millis() as u64))??;
        if read == 0 {
            return Err(Error::Disconnected);
        }
        out.push(byte[0]);
        if out.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}
