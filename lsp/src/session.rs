//! Seams for the protocol session that talks to the worker.
//!
//! Message framing and the request/response protocol belong to the session,
//! not to this crate. The bootstrap only hands a connected
//! [`TransportHandle`] to a [`SessionFactory`] and later asks the resulting
//! [`ProtocolSession`] to stop.

use std::future::Future;

use crate::transport::TransportHandle;

/// A running protocol exchange over a worker transport.
pub trait ProtocolSession: Send + Sized {
    /// End the exchange. The worker is expected to exit as a consequence
    /// (shutdown handshake, closed stdin); the session never kills it.
    fn stop(self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Builds a session once the worker is up.
pub trait SessionFactory: Send + Sync {
    type Session: ProtocolSession;

    fn connect(
        &self,
        transport: TransportHandle,
    ) -> impl Future<Output = anyhow::Result<Self::Session>> + Send;
}
