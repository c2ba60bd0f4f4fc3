//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM cancel a shared [`ShutdownToken`]. Async tasks await
//! [`ShutdownToken::cancelled`]; blocking tail workers poll
//! [`ShutdownToken::is_cancelled`] between reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

/// A token shared across tasks and threads to observe shutdown.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Request shutdown; wakes every task waiting in `cancelled`.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not lost
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Listens for SIGINT/SIGTERM and cancels the token on the first one.
/// The listener stops when the guard is dropped.
pub struct ShutdownGuard {
    handle: JoinHandle<()>,
}

impl ShutdownGuard {
    /// If handlers cannot be registered (restricted environments), the guard
    /// is still created but only programmatic cancellation works.
    pub fn install(token: ShutdownToken) -> Self {
        let handle = tokio::spawn(async move {
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGINT handler: {}", e);
                    None
                }
            };

            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    None
                }
            };

            match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => info!("Received SIGINT, shutting down..."),
                        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    info!("Received SIGINT, shutting down...");
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    info!("Received SIGTERM, shutting down...");
                }
                (None, None) => {
                    warn!("No signal handlers registered - graceful shutdown disabled");
                    return;
                }
            }
            token.cancel();
        });

        Self { handle }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
