//! Stop signal shared by every protocol loop of a node

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Why the loops are being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
}

/// Fan-out of a single stop request to the presence, registry and
/// negotiation tasks of a node
#[derive(Debug)]
pub struct ShutdownCoordinator {
    signal_tx: broadcast::Sender<ShutdownSignal>,
    state_tx: watch::Sender<ShutdownState>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(16);
        let (state_tx, _) = watch::channel(ShutdownState::Running);
        Self { signal_tx, state_tx }
    }

    /// Listener for loops that `select!` on the stop signal
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            signal_rx: self.signal_tx.subscribe(),
            state_rx: self.state_tx.subscribe(),
        }
    }

    /// Ask every loop to finish its current step and exit.
    /// Only the first call has an effect.
    pub fn shutdown(&self, signal: ShutdownSignal) {
        let first = self.state_tx.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Stopping;
                true
            } else {
                false
            }
        });
        if !first {
            debug!("Shutdown already requested");
            return;
        }

        match signal {
            ShutdownSignal::Graceful => info!("Stopping protocol loops"),
            ShutdownSignal::Immediate => warn!("Stopping protocol loops immediately"),
        }
        // No receivers simply means no loop is running yet.
        let _ = self.signal_tx.send(signal);
    }

    pub fn state(&self) -> ShutdownState {
        *self.state_tx.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == ShutdownState::Stopping
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-loop handle on the stop signal
#[derive(Debug)]
pub struct ShutdownListener {
    signal_rx: broadcast::Receiver<ShutdownSignal>,
    state_rx: watch::Receiver<ShutdownState>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been requested, including requests made
    /// before this listener started waiting.
    /// Dropping the coordinator counts as a graceful request.
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            biased;
            signal = self.signal_rx.recv() => signal.unwrap_or(ShutdownSignal::Graceful),
            _ = stopping(&mut self.state_rx) => ShutdownSignal::Graceful,
        }
    }
}

async fn stopping(state_rx: &mut watch::Receiver<ShutdownState>) {
    loop {
        if *state_rx.borrow_and_update() == ShutdownState::Stopping {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Run `task` until it finishes or shutdown is requested, logging under `name`
pub async fn run_until_shutdown<F>(name: &str, mut listener: ShutdownListener, task: F)
where
    F: Future<Output = ()>,
{
    debug!(component = name, "Starting");
    tokio::select! {
        _ = task => debug!(component = name, "Finished"),
        signal = listener.recv() => debug!(component = name, ?signal, "Stopped"),
    }
}

/// Trigger a graceful shutdown on SIGINT/SIGTERM (Ctrl+C elsewhere)
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                _ => {
                    warn!("Failed to install unix signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
        coordinator.shutdown(ShutdownSignal::Graceful);
    });
}
