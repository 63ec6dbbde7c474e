//! relay-fabric/src/transport.rs
//! Multipath-capable TCP transport primitives and the UDP ping responder. Every
//! listener/dialer in the fabric goes through here so the MPTCP-vs-plain-TCP choice
//! lives in one place.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Linux's `IPPROTO_MPTCP`. Not exposed by `socket2::Protocol` as a constant.
#[cfg(target_os = "linux")]
const IPPROTO_MPTCP: i32 = 262;

fn mptcp_socket(domain: Domain) -> std::io::Result<Socket> {
    #[cfg(target_os = "linux")]
    {
        Socket::new(domain, Type::STREAM, Some(Protocol::from(IPPROTO_MPTCP)))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = domain;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "MPTCP only available on linux",
        ))
    }
}

/// Binds a listener on `addr`, preferring an MPTCP socket and transparently falling
/// back to a plain TCP socket when the platform or kernel doesn't support MPTCP.
pub async fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

    let socket = match mptcp_socket(domain) {
        Ok(s) => {
            debug!(%addr, "binding MPTCP listener");
            s
        }
        Err(e) => {
            debug!(%addr, error = %e, "MPTCP unavailable, falling back to plain TCP");
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?
        }
    };

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Dials `addr`, preferring MPTCP with the same fallback as `bind_listener`.
pub async fn dial(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

    let socket = match mptcp_socket(domain) {
        Ok(s) => s,
        Err(_) => Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?,
    };
    socket.set_nonblocking(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    Ok(stream)
}

/// UDP ping responder for the fabric's ping port. Echoes `"pong"` to every datagram it
/// receives, forever, until the socket errors.
pub async fn run_ping_responder(socket: UdpSocket) {
    let mut buf = [0u8; 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((_, peer)) => {
                if let Err(e) = socket.send_to(b"pong", peer).await {
                    warn!(error = %e, "failed to send pong");
                }
            }
            Err(e) => {
                warn!(error = %e, "ping responder socket error");
                break;
            }
        }
    }
}

/// Client-side ping RTT probe used by the reference client's `.service` command:
/// sends `"ping"`, waits up to 2s for a reply.
pub async fn ping_rtt(target: SocketAddr) -> std::io::Result<Duration> {
    let local_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(local_addr).await?;
    socket.connect(target).await?;
    let start = std::time::Instant::now();
    socket.send(b"ping").await?;

    let mut buf = [0u8; 16];
    tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf)).await??;
    Ok(start.elapsed())
}
