//! Protocol level tests: a raw TCP client against the loop driven
//! server, and the full RtspClient/RtspServer pair streaming L16 audio
//! over the loopback interface.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use audiocast_rtp_core::{PcmBufferSource, RtpAudioFormat, RtpPacket, RtpStreamer};
use audiocast_rtsp_core::{RtspClient, RtspServer, RtspServerConfig, RtspServerLoop};

/// One RTP fragment of L16/44100/2: 441 frames, 1764 bytes
fn ramp_fragment() -> Vec<u8> {
    let mut data = Vec::with_capacity(1764);
    for i in 0i16..882 {
        data.extend_from_slice(&i.to_ne_bytes());
    }
    data
}

fn l16_streamer() -> RtpStreamer {
    let mut format = RtpAudioFormat::l16(44_100, 2);
    format.set_fragment_size(1764);
    let source = PcmBufferSource::new(format, ramp_fragment()).with_looping();
    RtpStreamer::new(Box::new(source))
}

async fn read_reply(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed while reading reply");
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let content_length = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed while reading body");
        data.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&data).into_owned()
}

fn header_of<'a>(reply: &'a str, name: &str) -> Option<&'a str> {
    reply.lines().find_map(|l| {
        let (key, value) = l.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

#[tokio::test]
async fn test_raw_handshake_against_loop_server() {
    let mut server = RtspServerLoop::new(l16_streamer(), RtspServerConfig {
        port: 0,
        ..Default::default()
    });
    let port = server.begin().await.unwrap();
    tokio::spawn(async move {
        loop {
            server.do_loop().await;
        }
    });

    let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // OPTIONS
    tcp.write_all(b"OPTIONS rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 1\r\n\r\n")
        .await
        .unwrap();
    let reply = read_reply(&mut tcp).await;
    assert!(reply.starts_with("RTSP/1.0 200 OK"));
    assert!(reply.contains("CSeq: 1\r\n"));
    assert!(header_of(&reply, "Public").unwrap().contains("DESCRIBE"));

    // DESCRIBE: L16 stereo 44.1 kHz must yield the static payload type 10
    tcp.write_all(
        b"DESCRIBE rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n",
    )
    .await
    .unwrap();
    let reply = read_reply(&mut tcp).await;
    assert!(reply.contains("CSeq: 2\r\n"));
    assert_eq!(
        header_of(&reply, "Content-Type"),
        Some("application/sdp")
    );
    assert!(reply.contains("m=audio 0 RTP/AVP 10\r\n"));
    assert!(reply.contains("a=rtpmap:10 L16/44100/2\r\n"));
    assert!(reply.contains("a=control:trackID=0"));

    // SETUP announcing our UDP receive port
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rtp_port = udp.local_addr().unwrap().port();
    let setup = format!(
        "SETUP rtsp://127.0.0.1:8554/trackID=0 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
        rtp_port,
        rtp_port + 1
    );
    tcp.write_all(setup.as_bytes()).await.unwrap();
    let reply = read_reply(&mut tcp).await;
    assert!(reply.contains("CSeq: 3\r\n"));
    let session_id = header_of(&reply, "Session").unwrap().to_string();
    let transport = header_of(&reply, "Transport").unwrap();
    assert!(transport.contains(&format!("client_port={}-{}", rtp_port, rtp_port + 1)));
    let server_port: u16 = transport
        .split("server_port=")
        .nth(1)
        .unwrap()
        .split('-')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(server_port % 2, 0, "server RTP port must be even");

    // PLAY starts the RTP flow towards our port
    let play = format!(
        "PLAY rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n",
        session_id
    );
    tcp.write_all(play.as_bytes()).await.unwrap();
    let reply = read_reply(&mut tcp).await;
    assert!(reply.contains("CSeq: 4\r\n"));
    assert!(reply.contains("Range: npt=0.000-\r\n"));
    assert!(reply.contains(&format!("Session: {}\r\n", session_id)));

    let mut buf = [0u8; 2048];
    let mut packets = Vec::new();
    while packets.len() < 3 {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), udp.recv_from(&mut buf))
            .await
            .expect("no RTP packets arrived")
            .unwrap();
        packets.push(RtpPacket::parse(&buf[..n]).unwrap());
    }
    for packet in &packets {
        assert_eq!(packet.size(), 12 + 1764);
        assert_eq!(packet.header.payload_type, 10);
        assert!(packet.header.marker);
    }
    for pair in packets.windows(2) {
        assert_eq!(
            pair[1].header.sequence_number,
            pair[0].header.sequence_number.wrapping_add(1)
        );
        assert_eq!(
            pair[1].header.timestamp,
            pair[0].header.timestamp.wrapping_add(441)
        );
    }

    // TEARDOWN closes the session
    let teardown = format!(
        "TEARDOWN rtsp://127.0.0.1:8554/ RTSP/1.0\r\nCSeq: 5\r\nSession: {}\r\n\r\n",
        session_id
    );
    tcp.write_all(teardown.as_bytes()).await.unwrap();
    let reply = read_reply(&mut tcp).await;
    assert!(reply.contains("CSeq: 5\r\n"));
}

#[tokio::test]
async fn test_client_server_loopback_streams_audio() {
    let mut server = RtspServer::new(l16_streamer(), RtspServerConfig {
        port: 0,
        ..Default::default()
    });
    let port = server.begin().await.unwrap();
    server.run().unwrap();

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let mut client = RtspClient::new(move |data: &[u8]| {
        sink.lock().unwrap().extend_from_slice(data);
    });

    client
        .begin(IpAddr::V4(Ipv4Addr::LOCALHOST), port, None)
        .await
        .unwrap();
    assert!(client.is_started());
    assert!(client.is_playing());
    assert_eq!(client.payload_type(), Some(10));
    assert_eq!(client.mime().unwrap(), "audio/L16");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while received.lock().unwrap().len() < 3 * 1764 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no audio arrived in time"
        );
        client.copy().await;
    }

    // every fragment is one period of the ramp, byte order restored
    let expected = ramp_fragment();
    let collected = received.lock().unwrap().clone();
    assert_eq!(&collected[..1764], expected.as_slice());
    assert_eq!(&collected[1764..2 * 1764], expected.as_slice());

    client.end().await;
    assert!(!client.is_started());
    server.end().await;
}

#[tokio::test]
async fn test_second_client_is_rejected_while_busy() {
    let mut server = RtspServer::new(l16_streamer(), RtspServerConfig {
        port: 0,
        ..Default::default()
    });
    let port = server.begin().await.unwrap();
    server.run().unwrap();

    // first client occupies the single session slot
    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    first
        .write_all(b"OPTIONS rtsp://127.0.0.1/ RTSP/1.0\r\nCSeq: 1\r\n\r\n")
        .await
        .unwrap();
    let reply = read_reply(&mut first).await;
    assert!(reply.contains("200 OK"));
    assert_eq!(server.client_count(), 1);

    // the second connection is accepted and immediately dropped
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    second
        .write_all(b"OPTIONS rtsp://127.0.0.1/ RTSP/1.0\r\nCSeq: 1\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "second client should see a closed connection");

    server.end().await;
}
