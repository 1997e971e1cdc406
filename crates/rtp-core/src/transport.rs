use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::error::Error;
use crate::{Result, RTP_PORT_SCAN_START};

/// Bound RTP/RTCP socket pair shared between sessions.
///
/// Handles are cheap clones; the sockets close when the last handle is
/// dropped. The RTP port is always even and the RTCP port is the
/// following odd port, as expected by RTSP clients.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    rtp_port: u16,
    rtcp_port: u16,
    client: Mutex<SocketAddr>,
}

/// Factory for [`TransportHandle`]s
pub struct RtpTransport;

impl RtpTransport {
    /// Bind an even/odd UDP port pair, scanning upwards from 6970, and
    /// aim it at the given client RTP destination.
    pub async fn acquire(client_ip: IpAddr, client_rtp_port: u16) -> Result<TransportHandle> {
        let mut port = RTP_PORT_SCAN_START;
        while port < 0xFFFE {
            if let Ok(rtp) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port + 1)).await {
                    Ok(rtcp) => {
                        info!(rtp_port = port, rtcp_port = port + 1, "udp transport bound");
                        return Ok(TransportHandle {
                            inner: Arc::new(TransportInner {
                                rtp,
                                rtcp,
                                rtp_port: port,
                                rtcp_port: port + 1,
                                client: Mutex::new(SocketAddr::new(client_ip, client_rtp_port)),
                            }),
                        });
                    }
                    Err(_) => {
                        // odd port taken, try the next even pair
                        debug!(port = port + 1, "rtcp port unavailable");
                    }
                }
            }
            port += 2;
        }
        Err(Error::ResourceExhausted(format!(
            "no even/odd UDP pair free above {}",
            RTP_PORT_SCAN_START
        )))
    }
}

impl TransportHandle {
    /// Local RTP port (even)
    pub fn rtp_port(&self) -> u16 {
        self.inner.rtp_port
    }

    /// Local RTCP port (rtp_port + 1)
    pub fn rtcp_port(&self) -> u16 {
        self.inner.rtcp_port
    }

    /// Retarget the client RTP destination
    pub fn set_client(&self, addr: SocketAddr) {
        *self.inner.client.lock() = addr;
    }

    pub fn client(&self) -> SocketAddr {
        *self.inner.client.lock()
    }

    /// Number of handles sharing this socket pair
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Send one RTP datagram to the client destination
    pub async fn send_rtp(&self, data: &[u8]) -> Result<usize> {
        let dest = self.client();
        self.inner
            .rtp
            .send_to(data, dest)
            .await
            .map_err(|e| Error::Transport(format!("RTP send to {} failed: {}", dest, e)))
    }
}
