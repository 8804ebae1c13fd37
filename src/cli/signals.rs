//! Ctrl+C handling
//!
//! The first interrupt flips a process-wide flag and fires the shared
//! [`CancellationToken`]. Running commands are killed by the exec layer and
//! workflows stop before their next step; `main` maps the outcome to exit
//! code 130. A second interrupt exits at once.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{info, warn};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether the user interrupted this run
pub fn is_shutdown_requested() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

fn mark_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Cloneable one-shot cancellation signal
///
/// Every clone observes the same state; once cancelled it stays cancelled.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the token is cancelled (immediately if it already is)
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do about the `seen`-th interrupt of this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    Cancel,
    Exit,
}

fn interrupt_action(seen: u32) -> InterruptAction {
    if seen <= 1 {
        InterruptAction::Cancel
    } else {
        InterruptAction::Exit
    }
}

/// Cancel `token` on Ctrl+C (or SIGTERM on Unix). A second interrupt exits
/// with 130 straight away.
pub async fn setup_signal_handlers(token: CancellationToken) {
    let mut interrupts = match Interrupts::install() {
        Ok(interrupts) => interrupts,
        Err(e) => {
            warn!(error = %e, "failed to install interrupt handler");
            return;
        }
    };

    let mut seen = 0;
    loop {
        let name = match interrupts.next().await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "interrupt handler stopped");
                return;
            }
        };
        seen += 1;
        match interrupt_action(seen) {
            InterruptAction::Cancel => {
                eprintln!("\nReceived {name}, cancelling... (press Ctrl+C again to exit now)");
                info!(signal = name, "interrupt received");
                mark_interrupted();
                token.cancel();
            }
            InterruptAction::Exit => {
                eprintln!("\nReceived {name} again, exiting");
                warn!(signal = name, "second interrupt, exiting immediately");
                std::process::exit(130);
            }
        }
    }
}

#[cfg(unix)]
struct Interrupts {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Interrupts {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn next(&mut self) -> std::io::Result<&'static str> {
        Ok(tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        })
    }
}

#[cfg(not(unix))]
struct Interrupts;

#[cfg(not(unix))]
impl Interrupts {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> std::io::Result<&'static str> {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

/// Drive `future` to completion, or give up with `None` when `token` fires
pub async fn with_cancellation<F, T>(token: &CancellationToken, future: F) -> Option<T>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return None;
    }
    tokio::select! {
        result = future => Some(result),
        _ = token.cancelled() => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_starts_live() {
        assert!(!CancellationToken::new().is_cancelled());
        assert!(!CancellationToken::default().is_cancelled());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let original = CancellationToken::new();
        let copy = original.clone();

        copy.cancel();

        assert!(original.is_cancelled());
        assert!(copy.is_cancelled());
    }

    #[tokio::test]
    async fn test_with_cancellation_returns_result() {
        let token = CancellationToken::new();
        assert_eq!(with_cancellation(&token, async { "done" }).await, Some("done"));
    }

    #[tokio::test]
    async fn test_with_cancellation_skips_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(with_cancellation(&token, async { 1 }).await, None);
    }

    #[tokio::test]
    async fn test_with_cancellation_interrupts_pending_work() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = with_cancellation(&token, std::future::pending::<()>()).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_waiting_task() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_second_interrupt_exits() {
        assert_eq!(interrupt_action(1), InterruptAction::Cancel);
        assert_eq!(interrupt_action(2), InterruptAction::Exit);
        assert_eq!(interrupt_action(5), InterruptAction::Exit);
    }

    #[test]
    fn test_interrupt_flag() {
        INTERRUPTED.store(false, Ordering::SeqCst);
        assert!(!is_shutdown_requested());

        mark_interrupted();
        assert!(is_shutdown_requested());

        INTERRUPTED.store(false, Ordering::SeqCst);
    }
}
