//! Wire format: one packet per TCP connection, length-prefixed.
//!
//! A sender opens a connection, announces `{"Packet-Length": N}`, waits for
//! the receiver to echo that header back, then writes the `N`-byte JSON
//! body and closes. The receiver reads the header a byte at a time instead
//! of assuming it arrives in a single `read`, since TCP gives no such
//! guarantee for a 128-byte buffer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MAX_HEADER_BYTES: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct PacketHeader {
    #[serde(rename = "Packet-Length")]
    packet_length: usize,
}

/// The four packet kinds the overlay exchanges. `#[serde(tag = "header")]`
/// reproduces the source's flat `{"header": "...", ...}` envelope shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "header")]
pub enum Envelope {
    #[serde(rename = "CONNECT")]
    Connect { host: String, port: u16 },
    #[serde(rename = "CONNECT_ACCEPTED")]
    ConnectAccepted { nodes: Vec<(String, u16)> },
    #[serde(rename = "BROADCAST")]
    Broadcast {
        host: String,
        port: u16,
        id: String,
        body: serde_json::Value,
    },
    #[serde(rename = "PRIVATE")]
    Private {
        host: String,
        port: u16,
        body: serde_json::Value,
    },
}

impl Envelope {
    pub fn header_name(&self) -> &'static str {
        match self {
            Envelope::Connect { .. } => "CONNECT",
            Envelope::ConnectAccepted { .. } => "CONNECT_ACCEPTED",
            Envelope::Broadcast { .. } => "BROADCAST",
            Envelope::Private { .. } => "PRIVATE",
        }
    }
}

fn decode_err(error: serde_json::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, error)
}

/// Connects to `(host, port)`, sends `envelope`, and returns once it has
/// been fully written. Surfaces every error to the caller; see
/// [`send_ignoring`] for the fire-and-forget variant most callers want.
pub async fn send_envelope(host: &str, port: u16, envelope: &Envelope) -> std::io::Result<()> {
    let mut stream = TcpStream::connect((host, port)).await?;

    let body = serde_json::to_vec(envelope).map_err(decode_err)?;
    let header = serde_json::to_vec(&PacketHeader {
        packet_length: body.len(),
    })
    .map_err(decode_err)?;

    stream.write_all(&header).await?;

    let mut ack = vec![0u8; header.len()];
    stream.read_exact(&mut ack).await?;

    stream.write_all(&body).await?;
    Ok(())
}

/// Like [`send_envelope`], but swallows any error. This matches the
/// source's default `ignore_errors=True`, used everywhere except the
/// broadcast forwarding loop, which needs to see `ConnectionRefused` to
/// prune dead neighbors.
pub async fn send_ignoring(host: &str, port: u16, envelope: &Envelope) {
    if let Err(error) = send_envelope(host, port, envelope).await {
        tracing::debug!(%error, %host, %port, "send failed, ignoring");
    }
}

/// Reads one packet from an accepted connection: the length header (a byte
/// at a time, to tolerate partial reads), an echo of that header, then the
/// body itself.
pub async fn recv_envelope(stream: &mut TcpStream) -> std::io::Result<Envelope> {
    let (header_bytes, header) = read_header(stream).await?;
    stream.write_all(&header_bytes).await?;

    let mut body = vec![0u8; header.packet_length];
    stream.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(decode_err)
}

async fn read_header(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, PacketHeader)> {
    let mut buf = Vec::with_capacity(32);
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before a packet header arrived",
            ));
        }
        buf.push(byte[0]);
        if let Ok(header) = serde_json::from_slice::<PacketHeader>(&buf) {
            return Ok((buf, header));
        }
        if buf.len() >= MAX_HEADER_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "packet header exceeded the maximum size without parsing",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_a_connect_envelope() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let envelope = Envelope::Connect {
            host: "127.0.0.1".to_string(),
            port: 4000,
        };
        let sent = envelope.clone();
        let sender = tokio::spawn(async move {
            send_envelope("127.0.0.1", addr.port(), &sent).await.unwrap();
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let received = recv_envelope(&mut stream).await.unwrap();
        sender.await.unwrap();

        match received {
            Envelope::Connect { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 4000);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_a_connection_with_no_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            drop(stream);
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let result = recv_envelope(&mut stream).await;
        client.await.unwrap();

        assert!(result.is_err());
    }
}
