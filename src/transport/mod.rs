//! Connection establishment over TCP.
//!
//! Provides the raw byte stream the engine runs on. Protocol handling is done
//! by [`Session`](crate::streaming::Session).

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::{LoopError, Result};
use crate::streaming::Connection;

/// Connect to a responder.
pub async fn dial<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> Result<(Connection, SocketAddr)> {
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| LoopError::Config(format!("cannot connect to {:?}: {}", addr, e)))?;
    wrap(stream)
}

/// Bind the responder's listening socket.
pub async fn bind<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> Result<TcpListener> {
    TcpListener::bind(&addr)
        .await
        .map_err(|e| LoopError::Config(format!("cannot bind {:?}: {}", addr, e)))
}

/// Accept one inbound connection.
pub async fn accept(listener: &TcpListener) -> Result<(Connection, SocketAddr)> {
    let (stream, _) = listener.accept().await?;
    wrap(stream)
}

fn wrap(stream: TcpStream) -> Result<(Connection, SocketAddr)> {
    // Blocks are small and latency probes must not sit in Nagle's buffer
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    Ok((Connection::new(stream), peer))
}
