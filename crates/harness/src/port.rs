//! Loopback port allocation

use std::net::{Ipv4Addr, TcpListener};

use crate::error::SetupError;

/// Ask the OS for a port that is unbound on loopback right now.
///
/// The listener is dropped before returning, so another process may grab the
/// port before the server binds it. [`crate::server::DevServer`] retries with
/// a fresh port when that happens.
pub fn allocate_port() -> Result<u16, SetupError> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(SetupError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(SetupError::PortAllocation)?
        .port();
    Ok(port)
}
