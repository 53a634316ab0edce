use std::net::{IpAddr, UdpSocket};

/// Address of the interface used for outbound traffic, i.e. the one other
/// devices on the LAN reach this host on.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
