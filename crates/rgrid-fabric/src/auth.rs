//! Wire authentication handshake.
//!
//! A fixed 4-stage exchange verifies that both ends belong to the same job
//! before any payload flows:
//!
//!   1. connector: `u32 service_id`, `u32 connect_len`, connect text
//!   2. accepter : validates each with a per-read reply timeout; on any
//!      mismatch writes a NACK (guaranteed ≠ service id) and gives up
//!   3. accepter : `u32 service_id`, `u32 accept_len`, accept text
//!   4. connector: validates, then writes `u32 ack = 1`
//!
//! Exceeding the reply timeout is an authentication failure, not a protocol
//! error. When authentication is disabled both sides succeed without
//! exchanging a byte.

use std::net::TcpStream;

use log::debug;

use crate::error::{FabricError, Result};
use crate::fdio;

/// Service id announced by every rgrid fabric endpoint ("rgrd").
const SERVICE_ID: u32 = 0x7267_7264;

/// NACK value written on mismatch; must not equal [`SERVICE_ID`].
const NACK: u32 = 0;

const ACK: u32 = 1;

/// Authentication parameters shared by both handshake sides.
#[derive(Debug, Clone)]
pub struct AuthParams {
    pub enabled: bool,
    /// Per-read reply timeout in milliseconds.
    pub reply_timeout_ms: i32,
    /// Text the connector must present.
    pub connect_text: String,
    /// Text the accepter replies with.
    pub accept_text: String,
}

impl AuthParams {
    /// Symmetric parameters: the same text in both directions.
    pub fn symmetric(text: &str, enabled: bool, reply_timeout_ms: i32) -> AuthParams {
        AuthParams {
            enabled,
            reply_timeout_ms,
            connect_text: text.to_string(),
            accept_text: text.to_string(),
        }
    }
}

/// Connector side of the handshake.
pub fn authenticate_connect(stream: &mut TcpStream, auth: &AuthParams) -> Result<()> {
    if !auth.enabled {
        return Ok(());
    }
    let connect = auth.connect_text.as_bytes();
    fdio::write_u32(stream, SERVICE_ID)?;
    fdio::write_u32(stream, connect.len() as u32)?;
    fdio::write_fd(stream, connect)?;

    let timeout = auth.reply_timeout_ms;
    let service = read_auth_u32(stream, timeout)?;
    if service != SERVICE_ID {
        debug!("authenticate_connect: bad service id {service:#x}");
        return Err(FabricError::AuthFailed);
    }
    let accept_len = read_auth_u32(stream, timeout)? as usize;
    if accept_len != auth.accept_text.len() {
        debug!("authenticate_connect: bad accept text length {accept_len}");
        return Err(FabricError::AuthFailed);
    }
    let mut accept = vec![0u8; accept_len];
    read_auth(stream, &mut accept, timeout)?;
    if accept != auth.accept_text.as_bytes() {
        debug!("authenticate_connect: accept text mismatch");
        return Err(FabricError::AuthFailed);
    }
    fdio::write_u32(stream, ACK)?;
    Ok(())
}

/// Accepter side of the handshake.
///
/// On mismatch a NACK is written before failing so the connecting peer can
/// abandon the endpoint quickly instead of waiting out its reply timeout.
pub fn authenticate_accept(stream: &mut TcpStream, auth: &AuthParams) -> Result<()> {
    if !auth.enabled {
        return Ok(());
    }
    let timeout = auth.reply_timeout_ms;
    let verdict = accept_validate(stream, auth, timeout);
    if verdict.is_err() {
        // the value is guaranteed not to match the service id
        let _ = fdio::write_u32(stream, NACK);
        return verdict;
    }
    let accept = auth.accept_text.as_bytes();
    fdio::write_u32(stream, SERVICE_ID)?;
    fdio::write_u32(stream, accept.len() as u32)?;
    fdio::write_fd(stream, accept)?;

    // the peer may have dropped us if our reply came too slowly; its ack
    // confirms the connection completed
    let ack = read_auth_u32(stream, timeout)?;
    if ack != ACK {
        debug!("authenticate_accept: unexpected ack value {ack}");
        return Err(FabricError::AuthFailed);
    }
    Ok(())
}

fn accept_validate(stream: &mut TcpStream, auth: &AuthParams, timeout: i32) -> Result<()> {
    let service = read_auth_u32(stream, timeout)?;
    if service != SERVICE_ID {
        debug!("authenticate_accept: bad service id {service:#x}");
        return Err(FabricError::AuthFailed);
    }
    let connect_len = read_auth_u32(stream, timeout)? as usize;
    if connect_len != auth.connect_text.len() {
        debug!("authenticate_accept: bad connect text length {connect_len}");
        return Err(FabricError::AuthFailed);
    }
    let mut connect = vec![0u8; connect_len];
    read_auth(stream, &mut connect, timeout)?;
    if connect != auth.connect_text.as_bytes() {
        debug!("authenticate_accept: connect text mismatch");
        return Err(FabricError::AuthFailed);
    }
    Ok(())
}

/// Any read failure during the handshake is an authentication failure.
fn read_auth_u32(stream: &mut TcpStream, timeout: i32) -> Result<u32> {
    fdio::read_u32_timeout(stream, timeout).map_err(|_| FabricError::AuthFailed)
}

fn read_auth(stream: &mut TcpStream, buf: &mut [u8], timeout: i32) -> Result<()> {
    fdio::read_fd_timeout(stream, buf, timeout).map_err(|_| FabricError::AuthFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn handshake(connector: AuthParams, accepter: AuthParams) -> (Result<()>, Result<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let t = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            authenticate_connect(&mut stream, &connector)
        });
        let (mut stream, _) = listener.accept().unwrap();
        let accept_rc = authenticate_accept(&mut stream, &accepter);
        let connect_rc = t.join().unwrap();
        (connect_rc, accept_rc)
    }

    #[test]
    fn test_handshake_success() {
        let p = AuthParams::symmetric("rgrid-7", true, 5000);
        let (c, a) = handshake(p.clone(), p);
        assert!(c.is_ok());
        assert!(a.is_ok());
    }

    #[test]
    fn test_handshake_text_mismatch() {
        let (c, a) = handshake(
            AuthParams::symmetric("rgrid-7", true, 5000),
            AuthParams::symmetric("rgrid-8", true, 5000),
        );
        assert!(c.is_err());
        assert!(a.is_err());
    }

    #[test]
    fn test_handshake_disabled() {
        let p = AuthParams::symmetric("whatever", false, 5000);
        let (c, a) = handshake(p.clone(), p);
        assert!(c.is_ok());
        assert!(a.is_ok());
    }

    #[test]
    fn test_accepter_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = TcpStream::connect(addr).unwrap();
        let (mut stream, _) = listener.accept().unwrap();
        let p = AuthParams::symmetric("rgrid-7", true, 50);
        assert!(matches!(
            authenticate_accept(&mut stream, &p),
            Err(FabricError::AuthFailed)
        ));
    }
}
