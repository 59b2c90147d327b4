//! TCP listener and stream setup.
//!
//! Every stream, accepted or connected, gets `TCP_NODELAY`: frames are small
//! and latency matters more than packet count.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::{Result, RpcError};

/// Listening socket for a server.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind to `host:port`.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidArgument`] if `port` is 0: a server must be given
    /// a concrete port. Use [`Listener::from_tokio`] to serve an ephemeral
    /// listener.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(RpcError::InvalidArgument("Provide a valid port!".to_string()));
        }
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self { listener })
    }

    /// Wrap an already-bound listener.
    pub fn from_tokio(listener: TcpListener) -> Self {
        Self { listener }
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    /// Get the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Open a connection to a server.
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_zero_rejected() {
        let err = Listener::bind("127.0.0.1", 0).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
        assert_eq!(err.to_string(), "Invalid argument: Provide a valid port!");
    }

    #[tokio::test]
    async fn test_accept_and_connect() {
        let tokio_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = Listener::from_tokio(tokio_listener);
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(connect(addr), listener.accept());
        let client = client.unwrap();
        let (server_side, peer) = accepted.unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
        assert!(client.nodelay().unwrap());
        assert!(server_side.nodelay().unwrap());
    }
}
