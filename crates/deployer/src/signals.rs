//! Signal handling for the daemon loop and single runs.
//!
//! SIGTERM and SIGINT request shutdown: the current step finishes, nothing
//! new starts. SIGHUP asks the daemon to run every recurring task now.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Signal type forwarded to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Run recurring tasks immediately (SIGHUP)
    RunNow,
    /// Graceful shutdown (SIGTERM/SIGINT)
    Shutdown,
}

/// Set once shutdown was requested. Checked between orchestration steps.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bridges OS signals to the async runtime
#[derive(Debug)]
pub struct SignalManager {
    tx: broadcast::Sender<SignalType>,
    interrupted: InterruptFlag,
}

impl SignalManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            interrupted: InterruptFlag::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalType> {
        self.tx.subscribe()
    }

    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupted.clone()
    }

    /// Deliver a signal to subscribers as if it came from the OS
    pub fn notify(&self, signal: SignalType) {
        if signal == SignalType::Shutdown {
            self.interrupted.set();
        }
        // No subscribers is fine for single runs
        let _ = self.tx.send(signal);
    }

    /// Register handlers for SIGTERM, SIGINT and SIGHUP
    pub fn install(&self) -> io::Result<JoinHandle<()>> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;
        let tx = self.tx.clone();
        let interrupted = self.interrupted.clone();

        debug!("Installed signal handlers");
        Ok(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = term.recv() => SignalType::Shutdown,
                    _ = int.recv() => SignalType::Shutdown,
                    _ = hup.recv() => SignalType::RunNow,
                };
                info!(signal = ?received, "Received signal");
                if received == SignalType::Shutdown {
                    interrupted.set();
                }
                let _ = tx.send(received);
            }
        }))
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}
