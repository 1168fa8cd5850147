use std::{
    borrow::Cow,
    net::{IpAddr, SocketAddr},
};

/// Normalize a bind host.
///
/// `*` means all interfaces and maps to `0.0.0.0`. IPv6 literals may be written
/// with or without brackets.
pub fn normalize_bind_host(host: &str) -> Cow<'_, str> {
    let host = host.trim();
    if host == "*" {
        return Cow::Borrowed("0.0.0.0");
    }
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return Cow::Borrowed(inner);
    }
    Cow::Borrowed(host)
}

/// Parse a bind host + port into a socket address.
pub fn bind_socket_addr(host: &str, port: u16) -> Option<SocketAddr> {
    let ip: IpAddr = normalize_bind_host(host).parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Normalize a `host:port` listen address; `":PORT"` binds all interfaces.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Join a host and port into a dialable `host:port` string, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if bare.contains(':') {
        format!("[{bare}]:{port}")
    } else {
        format!("{bare}:{port}")
    }
}

/// Whether binding `a` would collide with binding `b` on the same port.
///
/// A wildcard address overlaps every address of the same family.
pub fn endpoints_overlap(a: SocketAddr, b: SocketAddr) -> bool {
    if a.port() != b.port() {
        return false;
    }
    if a.ip() == b.ip() {
        return true;
    }
    let same_family = a.is_ipv4() == b.is_ipv4();
    same_family && (a.ip().is_unspecified() || b.ip().is_unspecified())
}
