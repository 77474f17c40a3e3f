//! Socket plumbing: bounded connects with retry/backoff, listener setup
//! over an optional port range, authenticated accept, and the hostname
//! port-scan connector used by the leader tree.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use rand::Rng;
use rgrid_core::ranges;

use crate::auth::{self, AuthParams};
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};

/// Upper bound on port-scan backoff: the per-connect timeout stops
/// doubling once it reaches this multiple of the configured base.
const PORT_SCAN_BACKOFF_CAP: u64 = 128;

/// A peer address as carried in wireup tables: 4 IP bytes + u16 port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Wire size of one [`Endpoint`].
pub const ENDPOINT_LEN: usize = 6;

impl Endpoint {
    pub fn to_bytes(self) -> [u8; ENDPOINT_LEN] {
        let mut buf = [0u8; ENDPOINT_LEN];
        buf[..4].copy_from_slice(&self.ip.octets());
        LittleEndian::write_u16(&mut buf[4..], self.port);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Endpoint {
        let mut ip = [0u8; 4];
        ip.copy_from_slice(&buf[..4]);
        Endpoint {
            ip: Ipv4Addr::from(ip),
            port: LittleEndian::read_u16(&buf[4..6]),
        }
    }

    pub fn addr(self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Connect with a bounded completion wait.
pub fn connect_timeout(addr: SocketAddr, millis: u64) -> Result<TcpStream> {
    TcpStream::connect_timeout(&addr, Duration::from_millis(millis))
        .map_err(|_| FabricError::ConnectFailed(addr.to_string()))
}

/// Make several connect attempts, sleeping between them (optionally a
/// randomized fraction of the backoff).
pub fn connect_retry(
    addr: SocketAddr,
    timeout_ms: u64,
    attempts: u32,
    sleep_ms: u64,
    random_backoff: bool,
) -> Result<TcpStream> {
    let mut rng = rand::rng();
    for attempt in 0..attempts {
        match connect_timeout(addr, timeout_ms) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(_) if attempt + 1 < attempts => {
                let sleep = if random_backoff && sleep_ms > 0 {
                    rng.random_range(0..=sleep_ms)
                } else {
                    sleep_ms
                };
                trace!("connect to {addr} failed, retrying in {sleep}ms");
                std::thread::sleep(Duration::from_millis(sleep));
            }
            Err(e) => return Err(e),
        }
    }
    Err(FabricError::ConnectFailed(addr.to_string()))
}

/// Connect using the configured retry/backoff policy.
pub fn connect(cfg: &FabricConfig, addr: SocketAddr) -> Result<TcpStream> {
    connect_retry(
        addr,
        cfg.connect_timeout_s as u64 * 1000,
        cfg.connect_tries,
        cfg.connect_backoff_s as u64 * 1000,
        cfg.connect_random,
    )
}

/// This host's name, for endpoint advertisement and error context.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// The IPv4 address peers should dial to reach this host.
fn advertised_ip() -> Ipv4Addr {
    let host = hostname();
    if let Ok(addrs) = (host.as_str(), 0u16).to_socket_addrs() {
        for addr in addrs {
            if let SocketAddr::V4(v4) = addr {
                return *v4.ip();
            }
        }
    }
    Ipv4Addr::LOCALHOST
}

/// Open a listening socket and report the endpoint peers should dial.
///
/// With no port range the OS assigns an ephemeral port. With a range, ports
/// are tried in range order starting at `portoffset` (wrapping), which
/// spreads concurrent jobs across the range.
pub fn open_listener(portrange: Option<&str>, portoffset: usize) -> Result<(TcpListener, Endpoint)> {
    let listener = match portrange {
        None => TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?,
        Some(range) => {
            let ports = ranges::range_numbers_size(range)?;
            if ports == 0 {
                return Err(FabricError::Config(format!("empty port range '{range}'")));
            }
            let mut bound = None;
            for i in 1..=ports {
                let index = (portoffset + i - 1) % ports + 1;
                let port: u16 = ranges::range_numbers_nth(range, index)?
                    .parse()
                    .map_err(|_| FabricError::Config(format!("bad port in range '{range}'")))?;
                match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
                    Ok(l) => {
                        debug!("opened listening socket on port {port}");
                        bound = Some(l);
                        break;
                    }
                    Err(e) => trace!("bind port {port}: {e}"),
                }
            }
            bound.ok_or_else(|| {
                FabricError::Config(format!("failed to bind socket to port in range '{range}'"))
            })?
        }
    };
    let port = listener.local_addr()?.port();
    Ok((
        listener,
        Endpoint {
            ip: advertised_ip(),
            port,
        },
    ))
}

/// Accept connections until one authenticates; returns the stream and the
/// remote endpoint.
pub fn accept_authed(listener: &TcpListener, auth: &AuthParams) -> Result<(TcpStream, Endpoint)> {
    loop {
        let (mut stream, peer) = match listener.accept() {
            Ok(x) => x,
            Err(e) => {
                debug!("accept failed: {e}, retrying");
                continue;
            }
        };
        match auth::authenticate_accept(&mut stream, auth) {
            Ok(()) => {
                stream.set_nodelay(true).ok();
                let ip = match peer {
                    SocketAddr::V4(v4) => *v4.ip(),
                    SocketAddr::V6(_) => Ipv4Addr::LOCALHOST,
                };
                return Ok((
                    stream,
                    Endpoint {
                        ip,
                        port: peer.port(),
                    },
                ));
            }
            Err(_) => {
                // authentication failed, wait for the real peer
                let _ = stream.flush();
            }
        }
    }
}

/// Connect to `host` by scanning the configured port range until a peer
/// authenticates or the scan time limit expires.
///
/// Each full pass doubles the per-connect timeout up to a cap so an
/// unresponsive scan backs off rather than hammering the range.
pub fn connect_hostname(
    cfg: &FabricConfig,
    rank: usize,
    host: &str,
    portrange: &str,
    portoffset: usize,
    auth: &AuthParams,
) -> Result<TcpStream> {
    let ports = ranges::range_numbers_size(portrange)?;
    if ports == 0 {
        return Err(FabricError::Config(format!(
            "empty port range '{portrange}'"
        )));
    }
    let timelimit = cfg.port_scan_timeout_s;
    let mut timeout_ms = cfg.port_scan_connect_timeout_ms as u64;
    // the per-connect timeout doubles after every full pass; longer waits
    // cut the packet rate on an unresponsive scan at the cost of slower
    // passes, so the growth stops at a bounded multiple of the base
    let max_timeout_ms = timeout_ms.saturating_mul(PORT_SCAN_BACKOFF_CAP);
    let sleep = Duration::from_millis(cfg.port_scan_connect_sleep_ms as u64);
    let start = Instant::now();

    loop {
        for i in 1..=ports {
            let index = (portoffset + i - 1) % ports + 1;
            let port: u16 = ranges::range_numbers_nth(portrange, index)?
                .parse()
                .map_err(|_| FabricError::Config(format!("bad port in range '{portrange}'")))?;
            let Some(addr) = resolve(host, port) else {
                return Err(FabricError::ConnectFailed(format!("{host}:{port}")));
            };
            trace!("trying rank {rank} on port {port} on {host}");
            if let Ok(mut stream) = connect_retry(
                addr,
                timeout_ms,
                cfg.port_scan_connect_attempts,
                cfg.port_scan_connect_sleep_ms as u64,
                false,
            ) {
                debug!("connected to rank {rank} port {port} on {host}");
                if auth::authenticate_connect(&mut stream, auth).is_ok() {
                    return Ok(stream);
                }
                // connected to something that is not our peer
            }
            std::thread::sleep(sleep);
        }
        // widen the per-connect timeout before the next pass, up to the cap
        timeout_ms = (timeout_ms * 2).min(max_timeout_ms);
        if timelimit >= 0 && start.elapsed().as_secs() > timelimit as u64 {
            return Err(FabricError::ConnectFailed(format!(
                "{host} ports {portrange} (scan timeout)"
            )));
        }
    }
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_bytes() {
        let ep = Endpoint {
            ip: Ipv4Addr::new(10, 1, 2, 3),
            port: 4321,
        };
        assert_eq!(Endpoint::from_bytes(&ep.to_bytes()), ep);
    }

    #[test]
    fn test_open_listener_ephemeral() {
        let (listener, ep) = open_listener(None, 0).unwrap();
        assert!(ep.port != 0);
        drop(listener);
    }

    #[test]
    fn test_open_listener_range() {
        // grab two listeners out of a small range; offsets rotate the scan
        let (l1, ep1) = open_listener(Some("34251-34259"), 0).unwrap();
        let (_l2, ep2) = open_listener(Some("34251-34259"), 0).unwrap();
        assert!(ep1.port >= 34251 && ep1.port <= 34259);
        assert!(ep2.port >= 34251 && ep2.port <= 34259);
        assert_ne!(ep1.port, ep2.port);
        drop(l1);
    }

    #[test]
    fn test_connect_retry_fails_fast() {
        // a port from the discard range that nothing listens on
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(connect_retry(addr, 50, 2, 1, false).is_err());
    }
}
