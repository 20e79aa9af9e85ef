//! Shared utility functions.

use std::io;
use std::net::TcpListener;

/// Shorten an identifier for log lines.
///
/// Slices on a char boundary so multi-byte ids never panic.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Ask the OS for a free TCP port on the loopback interface.
///
/// The listener is dropped before returning, so another process could grab
/// the port in between. Callers that spawn a server on it must be prepared
/// for a failed health check.
pub fn allocate_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
