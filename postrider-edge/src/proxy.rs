//! PROXY protocol v1 and v2 parsing, auto-detected ahead of the first
//! SMTP byte so an edge behind a load balancer sees real peer
//! addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error reading proxy header: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed proxy header: {0}")]
    Malformed(String),
}

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Read one PROXY protocol header off the front of `stream`.
///
/// Returns the advertised source address, or `None` for v1 `UNKNOWN`
/// and v2 `LOCAL` headers (the caller keeps the socket's own peer
/// address). The stream is left positioned at the first payload byte.
pub async fn read_proxy_header<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<SocketAddr>, ProxyError> {
    let mut lead = [0u8; 5];
    stream.read_exact(&mut lead).await?;

    if &lead == b"PROXY" {
        return read_v1(stream).await;
    }
    if lead == V2_SIGNATURE[..5] {
        return read_v2(stream).await;
    }
    Err(ProxyError::Malformed(format!(
        "unrecognized leader {lead:02x?}"
    )))
}

/// v1: an ASCII line, `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`.
async fn read_v1<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<SocketAddr>, ProxyError> {
    // The v1 line is at most 107 bytes including the leader.
    let mut line = Vec::with_capacity(102);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > 102 {
            return Err(ProxyError::Malformed("v1 line too long".into()));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    let line = String::from_utf8(line)
        .map_err(|_| ProxyError::Malformed("v1 line is not ASCII".into()))?;
    let mut fields = line.split_whitespace();
    match fields.next() {
        Some("TCP4" | "TCP6") => {}
        Some("UNKNOWN") => return Ok(None),
        other => {
            return Err(ProxyError::Malformed(format!(
                "bad v1 protocol field: {other:?}"
            )));
        }
    }

    let src_ip: IpAddr = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::Malformed("bad v1 source address".into()))?;
    let _dst_ip = fields.next();
    let src_port: u16 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::Malformed("bad v1 source port".into()))?;

    Ok(Some(SocketAddr::new(src_ip, src_port)))
}

/// v2: the 16-byte binary header followed by an address block.
async fn read_v2<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<SocketAddr>, ProxyError> {
    let mut rest = [0u8; 11];
    stream.read_exact(&mut rest).await?;
    if rest[..7] != V2_SIGNATURE[5..] {
        return Err(ProxyError::Malformed("bad v2 signature".into()));
    }

    let ver_cmd = rest[7];
    let family = rest[8];
    let len = usize::from(u16::from_be_bytes([rest[9], rest[10]]));

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    match ver_cmd {
        // LOCAL: health checks and the like; keep the socket peer.
        0x20 => Ok(None),
        0x21 => match family {
            // INET / STREAM
            0x11 => {
                if payload.len() < 12 {
                    return Err(ProxyError::Malformed("short v2 INET block".into()));
                }
                let src = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
                let port = u16::from_be_bytes([payload[8], payload[9]]);
                Ok(Some(SocketAddr::new(IpAddr::V4(src), port)))
            }
            // INET6 / STREAM
            0x21 => {
                if payload.len() < 36 {
                    return Err(ProxyError::Malformed("short v2 INET6 block".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[..16]);
                let port = u16::from_be_bytes([payload[32], payload[33]]);
                Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
            }
            // AF_UNSPEC or unsupported family: address block ignored.
            _ => Ok(None),
        },
        other => Err(ProxyError::Malformed(format!(
            "bad v2 version/command byte {other:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{ProxyError, read_proxy_header};

    #[tokio::test]
    async fn parses_v1_tcp4() {
        let mut input = Cursor::new(b"PROXY TCP4 192.0.2.1 198.51.100.2 56324 25\r\nEHLO".to_vec());
        let addr = read_proxy_header(&mut input).await.unwrap().unwrap();
        assert_eq!(addr.to_string(), "192.0.2.1:56324");
        // The SMTP payload is untouched.
        assert_eq!(input.position(), 44);
    }

    #[tokio::test]
    async fn parses_v1_tcp6() {
        let mut input =
            Cursor::new(b"PROXY TCP6 2001:db8::1 2001:db8::2 4000 25\r\n".to_vec());
        let addr = read_proxy_header(&mut input).await.unwrap().unwrap();
        assert_eq!(addr.ip().to_string(), "2001:db8::1");
        assert_eq!(addr.port(), 4000);
    }

    #[tokio::test]
    async fn v1_unknown_keeps_socket_peer() {
        let mut input = Cursor::new(b"PROXY UNKNOWN\r\n".to_vec());
        assert!(read_proxy_header(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parses_v2_inet() {
        let mut input = vec![
            0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A, // sig
            0x21, 0x11, 0x00, 0x0C, // PROXY, INET/STREAM, len 12
            192, 0, 2, 7, // src
            198, 51, 100, 1, // dst
            0xDC, 0x04, // src port 56324
            0x00, 0x19, // dst port 25
        ];
        input.extend_from_slice(b"EHLO");
        let mut input = Cursor::new(input);
        let addr = read_proxy_header(&mut input).await.unwrap().unwrap();
        assert_eq!(addr.to_string(), "192.0.2.7:56324");
        assert_eq!(input.position(), 28);
    }

    #[tokio::test]
    async fn v2_local_keeps_socket_peer() {
        let input = vec![
            0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A, // sig
            0x20, 0x00, 0x00, 0x00, // LOCAL, UNSPEC, len 0
        ];
        let mut input = Cursor::new(input);
        assert!(read_proxy_header(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let mut input = Cursor::new(b"EHLO client.example\r\n".to_vec());
        assert!(matches!(
            read_proxy_header(&mut input).await,
            Err(ProxyError::Malformed(_))
        ));
    }
}
