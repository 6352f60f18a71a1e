//! Publisher-confirmation bookkeeping.
//!
//! A publish is tracked under the transport's sequence number from the moment
//! it is handed to the broker until the broker acks or nacks it. Settling
//! removes the entry and tells the observer, once.

use std::{fmt, sync::Arc};

/// Called with `(success, message_id)` once per publish.
pub type PublishObserver = Arc<dyn Fn(bool, &str) + Send + Sync>;

#[derive(Default)]
pub struct PendingConfirmations {
    pending: papaya::HashMap<u64, String>,
    observer: Option<PublishObserver>,
}

impl PendingConfirmations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: PublishObserver) -> Self {
        Self {
            pending: papaya::HashMap::new(),
            observer: Some(observer),
        }
    }

    pub fn track(&self, sequence: u64, message_id: impl Into<String>) {
        let message_id = message_id.into();
        let pending = self.pending.pin();
        if let Some(previous) = pending.insert(sequence, message_id) {
            tracing::error!(sequence, %previous, "Sequence number reused before it was confirmed");
        }
    }

    /// Tracks `sequence` for as long as the returned guard lives. A guard
    /// dropped before [`Tracked::settle`] reports the publish as failed.
    #[must_use]
    pub fn watch(&self, sequence: u64, message_id: impl Into<String>) -> Tracked<'_> {
        self.track(sequence, message_id);
        Tracked {
            confirmations: self,
            sequence,
            settled: false,
        }
    }

    /// Clears `sequence` and reports the outcome. Returns the message id, or
    /// `None` if the sequence was never tracked or is already settled.
    pub fn settle(&self, sequence: u64, success: bool) -> Option<String> {
        let message_id = self.pending.pin().remove(&sequence).cloned();
        match &message_id {
            Some(id) => {
                tracing::debug!(sequence, message_id = %id, success, "Publish confirmed");
                self.notify(success, id);
            }
            None => {
                tracing::warn!(sequence, success, "Confirmation for unknown sequence number");
            }
        }
        message_id
    }

    /// Reports a publish on a transport without asynchronous confirmations.
    pub fn notify(&self, success: bool, message_id: &str) {
        if let Some(observer) = &self.observer {
            observer(success, message_id);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One publish awaiting its confirmation.
pub struct Tracked<'a> {
    confirmations: &'a PendingConfirmations,
    sequence: u64,
    settled: bool,
}

impl Tracked<'_> {
    pub fn settle(mut self, success: bool) -> Option<String> {
        self.settled = true;
        self.confirmations.settle(self.sequence, success)
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(sequence = self.sequence, "Stopped waiting for confirmation");
            self.confirmations.settle(self.sequence, false);
        }
    }
}

impl fmt::Debug for PendingConfirmations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConfirmations")
            .field("pending", &self.len())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_settle_reports_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let confirmations = PendingConfirmations::with_observer({
            let seen = seen.clone();
            Arc::new(move |success, id: &str| seen.lock().unwrap().push((success, id.to_owned())))
        });

        confirmations.track(1, "a");
        confirmations.track(2, "b");
        assert_eq!(confirmations.len(), 2);

        assert_eq!(confirmations.settle(2, false).as_deref(), Some("b"));
        assert_eq!(confirmations.settle(1, true).as_deref(), Some("a"));
        assert_eq!(confirmations.settle(1, true), None);

        assert!(confirmations.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(false, "b".to_owned()), (true, "a".to_owned())]
        );
    }

    #[test]
    fn test_dropped_watch_reports_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let confirmations = PendingConfirmations::with_observer({
            let seen = seen.clone();
            Arc::new(move |success, id: &str| seen.lock().unwrap().push((success, id.to_owned())))
        });

        let confirmed = confirmations.watch(1, "a");
        let abandoned = confirmations.watch(2, "b");
        assert_eq!(confirmations.len(), 2);

        assert_eq!(confirmed.settle(true).as_deref(), Some("a"));
        drop(abandoned);

        assert!(confirmations.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(true, "a".to_owned()), (false, "b".to_owned())]
        );
    }
}
