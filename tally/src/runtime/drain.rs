use std::sync::Arc;

use tokio::sync::watch;

/// Drain signal shared by the worker loop and the janitor tasks.
///
/// Stopping is cooperative and lease-aware. A worker idle between events
/// wakes from its sleep and exits at once; a worker mid-event completes
/// the apply and finish transactions it already started, so no total is
/// left half-updated. A claim the worker never got to finish is not torn
/// down on the way out: it expires on its own and the janitor recycles
/// the event.
///
/// Backed by a watch channel so every clone observes the transition, and
/// so waiting costs nothing until the drain is requested.
#[derive(Clone, Debug)]
pub struct DrainSignal {
    trigger: Arc<watch::Sender<bool>>,
    observer: watch::Receiver<bool>,
}

impl DrainSignal {
    pub fn new() -> Self {
        let (trigger, observer) = watch::channel(false);
        Self {
            trigger: Arc::new(trigger),
            observer,
        }
    }

    /// Ask every task holding a clone to wind down.
    ///
    /// Idempotent; draining never un-drains.
    pub fn drain(&self) {
        self.trigger.send_replace(true);
    }

    /// Whether a drain has been requested.
    ///
    /// The worker loop checks this between iterations, after any finish
    /// transaction has committed.
    pub fn is_draining(&self) -> bool {
        *self.observer.borrow()
    }

    /// Wait until a drain is requested.
    ///
    /// Select against this in idle sleeps and janitor intervals so a
    /// quiescent task does not sit out its full pause before exiting.
    pub async fn draining(&self) {
        let mut observer = self.observer.clone();
        // Err would mean every trigger is gone; treat that as drained.
        let _ = observer.wait_for(|draining| *draining).await;
    }
}

impl Default for DrainSignal {
    fn default() -> Self {
        Self::new()
    }
}
