//! Stdio relay between the editor and the worker.
//!
//! The editor speaks the language server protocol on this process's stdin and
//! stdout. The relay copies bytes in both directions without looking at them,
//! so framing stays entirely between editor and worker.

use std::sync::Arc;

use anyhow::Context;
use pineapple_lsp::{ProtocolSession, SessionFactory, TransportHandle};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Connects the worker transport to the process's own stdio.
#[derive(Debug, Clone, Default)]
pub struct ProxyFactory {
    host_closed: Arc<Notify>,
}

impl ProxyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notified once the editor closes our stdin.
    pub fn host_closed(&self) -> Arc<Notify> {
        Arc::clone(&self.host_closed)
    }
}

impl SessionFactory for ProxyFactory {
    type Session = ProxySession;

    async fn connect(&self, transport: TransportHandle) -> anyhow::Result<ProxySession> {
        let (reader, writer) = transport.into_split();
        Ok(ProxySession::spawn(
            io::stdin(),
            writer,
            reader,
            io::stdout(),
            self.host_closed(),
        ))
    }
}

/// The two relay tasks.
#[derive(Debug)]
pub struct ProxySession {
    inbound: JoinHandle<()>,
    outbound: JoinHandle<io::Result<u64>>,
}

impl ProxySession {
    /// Relay `host_in → worker_in` and `worker_out → host_out`.
    pub fn spawn<HI, WI, WO, HO>(
        mut host_in: HI,
        mut worker_in: WI,
        mut worker_out: WO,
        mut host_out: HO,
        host_closed: Arc<Notify>,
    ) -> Self
    where
        HI: AsyncRead + Unpin + Send + 'static,
        WI: AsyncWrite + Unpin + Send + 'static,
        WO: AsyncRead + Unpin + Send + 'static,
        HO: AsyncWrite + Unpin + Send + 'static,
    {
        let inbound = tokio::spawn(async move {
            match io::copy(&mut host_in, &mut worker_in).await {
                Ok(bytes) => tracing::debug!(bytes, "editor closed stdin"),
                Err(e) => tracing::debug!(error = %e, "stdin relay stopped"),
            }
            // EOF for the worker. The editor going away is a stop request
            // either way.
            let _ = worker_in.shutdown().await;
            drop(worker_in);
            host_closed.notify_one();
        });

        let outbound = tokio::spawn(async move {
            let bytes = io::copy(&mut worker_out, &mut host_out).await?;
            host_out.flush().await?;
            tracing::debug!(bytes, "worker closed stdout");
            Ok(bytes)
        });

        Self { inbound, outbound }
    }
}

impl ProtocolSession for ProxySession {
    /// Close the worker's stdin and wait until its stdout has been relayed
    /// to the end.
    async fn stop(self) -> anyhow::Result<()> {
        self.inbound.abort();
        if let Err(e) = self.inbound.await
            && e.is_panic()
        {
            tracing::warn!("stdin relay panicked: {e}");
        }

        self.outbound
            .await
            .context("stdout relay task failed")?
            .context("failed to relay worker stdout")?;
        Ok(())
    }
}
