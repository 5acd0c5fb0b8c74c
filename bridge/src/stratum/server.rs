/// Stratum bridge coordinator
///
/// Owns the listener, admits connections, runs the template refresher and
/// spawns one task per session. Shutdown cancels every task through a shared
/// token and waits for all of them, so no extranonce lease outlives the bridge.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{self, BridgeContext};
use crate::blockchain::TemplateRefresher;
use crate::metrics::prometheus as metrics;

pub struct StratumBridge {
    ctx: Arc<BridgeContext>,
    listener: TcpListener,
    local_addr: SocketAddr,
    block_wait: Duration,
    next_session: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl StratumBridge {
    /// Bind the Stratum listener (SO_REUSEADDR so restarts don't hit TIME_WAIT).
    pub async fn bind(addr: &str, ctx: BridgeContext, block_wait: Duration) -> Result<Self> {
        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", addr, e))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(sock_addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(sock_addr))?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        tracing::info!("✅ Stratum listening on {} (SO_REUSEADDR)", local_addr);

        Ok(Self {
            ctx: Arc::new(ctx),
            listener,
            local_addr,
            block_wait,
            next_session: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.ctx
    }

    /// Cancelling this token stops the bridge.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept miners until shutdown, then wait for every session to finish.
    pub async fn run(self) -> Result<()> {
        let refresher = TemplateRefresher::new(
            Arc::clone(&self.ctx.cache),
            Arc::clone(&self.ctx.node),
            self.block_wait,
        );
        self.tracker.spawn(refresher.run(self.cancel.child_token()));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => self.admit(socket, peer),
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        tracing::info!("🛑 Stratum bridge shutting down, waiting for {} tasks", self.tracker.len());
        drop(self.listener);
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Stratum bridge stopped");
        Ok(())
    }

    fn admit(&self, socket: TcpStream, peer: SocketAddr) {
        if self.ctx.allocator.is_exhausted() {
            metrics::inc_capacity_rejections();
            tracing::warn!(
                "🚫 Extranonce space full ({} live), rejecting {}",
                self.ctx.allocator.live(),
                peer
            );
            drop(socket);
            return;
        }

        let _ = socket.set_nodelay(true);
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.tracker.spawn(connection::serve(
            Arc::clone(&self.ctx),
            id,
            socket,
            peer,
            self.cancel.child_token(),
        ));
    }
}
