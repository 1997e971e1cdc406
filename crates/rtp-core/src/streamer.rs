use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::payload::RtpAudioFormat;
use crate::source::AudioSource;
use crate::transport::{RtpTransport, TransportHandle};
use crate::{Result, RtpSsrc, RTP_MIN_HEADER_SIZE, SSRC_AUDIOCAST};

/// Threshold above which a single send tick is reported as too slow
const SEND_WARN_THRESHOLD: Duration = Duration::from_millis(20);

/// How the periodic send loop is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// A timer tick per packet; the runtime keeps the cadence
    Timer,
    /// A free running task that throttles itself against wall time.
    /// Use for sources that can produce data faster than real time.
    Task,
}

/// Configuration for an [`RtpStreamer`]
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub pacing: Pacing,
    /// Packets between throttle corrections in [`Pacing::Task`] mode
    pub throttle_interval: u32,
    /// Fixed delay per loop iteration in [`Pacing::Task`] mode
    pub fixed_delay: Duration,
    pub ssrc: RtpSsrc,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::Timer,
            throttle_interval: 50,
            fixed_delay: Duration::from_millis(1),
            ssrc: SSRC_AUDIOCAST,
        }
    }
}

/// Periodically pulls audio from an [`AudioSource`], packs it into RTP
/// packets and sends them over UDP to the negotiated client port.
///
/// The send loop runs on its own tokio task. Sequence numbers start at
/// a random value and increase by one per packet; the timestamp
/// advances by the format's per packet sample count. The marker bit is
/// set on every packet.
pub struct RtpStreamer {
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    format: RtpAudioFormat,
    transport: Option<TransportHandle>,
    cfg: StreamerConfig,
    task: Option<JoinHandle<()>>,
}

impl RtpStreamer {
    pub fn new(source: Box<dyn AudioSource>) -> Self {
        Self::with_config(source, StreamerConfig::default())
    }

    pub fn with_config(source: Box<dyn AudioSource>, cfg: StreamerConfig) -> Self {
        let format = source.format().clone();
        info!(
            fragment_size = format.fragment_size(),
            period_us = format.timer_period_us(),
            "rtp streamer created"
        );
        Self {
            source: Arc::new(Mutex::new(source)),
            format,
            transport: None,
            cfg,
            task: None,
        }
    }

    /// Refresh fragment size and timer period from the audio source
    pub fn init_audio_source(&mut self) {
        self.format = self.source.lock().format().clone();
    }

    pub fn format(&self) -> &RtpAudioFormat {
        &self.format
    }

    /// Prepare the UDP socket pair for a client. Repeated calls reuse
    /// the existing pair and only retarget the destination.
    pub async fn init_udp_transport(&mut self, client_ip: IpAddr, client_port: u16) -> Result<()> {
        match &self.transport {
            Some(handle) => {
                handle.set_client((client_ip, client_port).into());
                debug!(ref_count = handle.ref_count(), "reusing udp transport");
            }
            None => {
                let handle = RtpTransport::acquire(client_ip, client_port).await?;
                self.transport = Some(handle);
            }
        }
        Ok(())
    }

    /// Drop this streamer's reference to the socket pair; the sockets
    /// close when the last reference goes away
    pub fn release_udp_transport(&mut self) {
        self.transport = None;
    }

    /// Local RTP port, 0 when no transport is bound
    pub fn rtp_server_port(&self) -> u16 {
        self.transport.as_ref().map(|t| t.rtp_port()).unwrap_or(0)
    }

    /// Local RTCP port, 0 when no transport is bound
    pub fn rtcp_server_port(&self) -> u16 {
        self.transport.as_ref().map(|t| t.rtcp_port()).unwrap_or(0)
    }

    pub fn is_streaming(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Start the periodic send task. Requires a bound transport.
    pub fn start(&mut self) -> Result<()> {
        if self.is_streaming() {
            return Ok(());
        }
        let Some(transport) = self.transport.clone() else {
            return Err(crate::Error::Streamer("no udp transport".into()));
        };

        self.init_audio_source();
        self.source.lock().start();

        let source = self.source.clone();
        let format = self.format.clone();
        let cfg = self.cfg.clone();
        info!(
            period_us = format.timer_period_us(),
            client = %transport.client(),
            "starting rtp stream"
        );

        self.task = Some(tokio::spawn(async move {
            run_send_loop(source, format, transport, cfg).await;
        }));
        Ok(())
    }

    /// Stop streaming and the audio source. Idempotent; the transport
    /// stays bound so the stream can be restarted with `start`.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            info!("stopping rtp stream");
            task.abort();
        }
        self.source.lock().stop();
    }
}

impl Drop for RtpStreamer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_send_loop(
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    format: RtpAudioFormat,
    transport: TransportHandle,
    cfg: StreamerConfig,
) {
    let fragment_size = format.fragment_size();
    let prefix_len = format.rtp_prefix_len();
    let payload_type = format.payload_type();
    let ts_increment = format.timestamp_increment();
    let period = Duration::from_micros(format.timer_period_us().max(1_000));

    let mut sequence: u16 = rand::thread_rng().gen();
    let mut timestamp: u32 = 0;
    let mut payload = vec![0u8; fragment_size];
    let mut packet = vec![0u8; RTP_MIN_HEADER_SIZE + prefix_len + fragment_size];

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut send_counter: u32 = 0;
    let mut window_start = Instant::now();

    loop {
        match cfg.pacing {
            Pacing::Timer => {
                ticker.tick().await;
            }
            Pacing::Task => {
                sleep(cfg.fixed_delay).await;
            }
        }

        let tick_start = Instant::now();
        let n = source.lock().read_bytes(&mut payload[..fragment_size]);
        if n > 0 {
            let wire_len = format.to_wire(&mut payload[..n]);

            // 12 byte header: V=2, M=1, PT, SEQ, TS, SSRC
            packet[0] = 0x80;
            packet[1] = 0x80 | (payload_type & 0x7F);
            packet[2] = (sequence >> 8) as u8;
            packet[3] = (sequence & 0xFF) as u8;
            packet[4..8].copy_from_slice(&timestamp.to_be_bytes());
            packet[8..12].copy_from_slice(&cfg.ssrc.to_be_bytes());
            // optional RFC 2250 MPEG audio header, fragment offset 0
            packet[RTP_MIN_HEADER_SIZE..RTP_MIN_HEADER_SIZE + prefix_len].fill(0);
            let data_start = RTP_MIN_HEADER_SIZE + prefix_len;
            packet[data_start..data_start + wire_len].copy_from_slice(&payload[..wire_len]);

            if let Err(e) = transport.send_rtp(&packet[..data_start + wire_len]).await {
                warn!("rtp send failed: {}", e);
            }

            sequence = sequence.wrapping_add(1);
            timestamp = timestamp.wrapping_add(ts_increment);
        }

        let elapsed = tick_start.elapsed();
        if elapsed > SEND_WARN_THRESHOLD {
            warn!(
                elapsed_us = elapsed.as_micros() as u64,
                "rtp stream can't keep up"
            );
        }

        // compensate sources that deliver faster than real time
        if cfg.pacing == Pacing::Task && cfg.throttle_interval > 0 {
            send_counter += 1;
            if send_counter >= cfg.throttle_interval {
                let expected = period * cfg.throttle_interval;
                let actual = window_start.elapsed();
                if actual < expected {
                    sleep(expected - actual).await;
                }
                send_counter = 0;
                window_start = Instant::now();
            }
        }
    }
}
