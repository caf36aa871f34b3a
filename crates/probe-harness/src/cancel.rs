use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

// ---------------------------------------------------------------------------
// CancelSignal -- structured cancellation for one unit of work
// ---------------------------------------------------------------------------

/// Watch-based cancellation signal.
///
/// Work that can be abandoned `select!`s on [`CancelSignal::cancelled`]
/// next to each await. A child signal fires when either it or any of its
/// ancestors is cancelled, so a run-wide signal can fan out to per-attempt
/// signals without the attempt cancelling its siblings.
///
/// ```ignore
/// let cancel = CancelSignal::new();
/// tokio::select! {
///     _ = cancel.cancelled() => { /* stop */ }
///     out = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelSignal>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            flag: Arc::new(AtomicBool::new(false)),
            parent: None,
        }
    }

    /// A new signal that also fires when `self` does.
    pub fn child(&self) -> Self {
        Self {
            parent: Some(Box::new(self.clone())),
            ..Self::new()
        }
    }

    /// Check without waiting.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        if self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("cancel signal triggered");
            self.tx.send_replace(true);
        }
    }

    /// Resolve once this signal or an ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers = Vec::new();
        let mut node = Some(self);
        while let Some(signal) = node {
            receivers.push(signal.tx.subscribe());
            node = signal.parent.as_deref();
        }
        let waits = receivers.into_iter().map(|mut rx| {
            Box::pin(async move {
                let _ = rx.wait_for(|fired| *fired).await;
            })
        });
        futures_util::future::select_all(waits).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// CancelGuard -- cancels on drop
// ---------------------------------------------------------------------------

/// RAII guard that fires its signal when dropped, so any work still holding
/// a clone of the signal stops once the owner goes out of scope.
pub struct CancelGuard {
    signal: CancelSignal,
}

impl CancelGuard {
    pub fn new(signal: CancelSignal) -> Self {
        Self { signal }
    }

    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.signal.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
