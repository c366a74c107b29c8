//! TCP accept loop for agent connections.
//!
//! Every accepted socket is served by its own task. The number of concurrent sessions
//! is bounded by a semaphore; connections beyond the limit are dropped right away.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onecmon_techlog::TechLogStorage;

use crate::error::ServerError;
use crate::session::{AgentSession, SessionContext};

pub struct AgentListener {
    listener: TcpListener,
    max_connections: usize,
}

impl AgentListener {
    /// Binds `bind_addr`. Failing to bind is fatal at startup.
    pub async fn bind(bind_addr: &str, max_connections: usize) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(bind_addr = %listener.local_addr()?, "listening for agents");
        Ok(Self {
            listener,
            max_connections: max_connections.max(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `cancel` fires, then waits for open sessions to end.
    pub async fn run<S: TechLogStorage>(self, ctx: SessionContext<S>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.max_connections));
        let mut sessions = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                result = self.listener.accept() => result,
                _ = cancel.cancelled() => break,
            };
            while sessions.try_join_next().is_some() {}

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }

            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                warn!(peer = %peer, max = self.max_connections, "max connections reached, rejecting");
                continue;
            };

            let ctx = ctx.clone();
            let session_cancel = cancel.child_token();
            sessions.spawn(async move {
                if let Err(e) = AgentSession::serve(stream, ctx, session_cancel).await {
                    if !e.is_protocol_violation() {
                        debug!(peer = %peer, error = %e, "session ended with error");
                    }
                }
                drop(permit);
            });
        }

        debug!(open = sessions.len(), "listener stopping");
        while sessions.join_next().await.is_some() {}
        info!("listener stopped");
    }
}
