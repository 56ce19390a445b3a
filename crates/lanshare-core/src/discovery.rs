//! Address discovery for the URL shown to peers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::warn;

/// Public address used only to pick the outbound route; nothing is sent
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Best-effort LAN address of this host
///
/// Connects an unbound UDP socket towards a public address and reads back the
/// local address the OS picked. Falls back to `127.0.0.1`.
pub fn local_ip() -> IpAddr {
    match probe_route() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Unable to determine local IP, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn probe_route() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(ROUTE_PROBE_ADDR)?;
    Ok(socket.local_addr()?.ip())
}

/// Websocket URL peers use to reach `ip:port`
pub fn advertised_url(ip: IpAddr, port: u16) -> String {
    format!("ws://{}", SocketAddr::new(ip, port))
}
