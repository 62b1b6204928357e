use crate::feedback::Signature;
use crate::oracle::CrashRecord;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of run progress after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressRecord {
    pub iteration: u64,
    pub corpus_size: usize,
    pub unique_crashes: usize,
    pub elapsed: Duration,
}

/// Something the fuzz loop reports to whoever is listening.
#[derive(Debug, Clone)]
pub enum FuzzEvent {
    Progress(ProgressRecord),
    /// An input with a new signature was retained.
    NewEntry {
        iteration: u64,
        signature: Signature,
        corpus_size: usize,
    },
    /// A crash with a previously unseen dedup key.
    NewCrash(CrashRecord),
}

/// Non-blocking sending half of the event stream.
///
/// Events are advisory. When the buffer is full the event is dropped and
/// counted instead of stalling a worker.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<Sender<FuzzEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Creates a stream buffering up to `capacity` events.
    pub fn channel(capacity: usize) -> (EventSender, Receiver<FuzzEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        let sender = EventSender {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sender, rx)
    }

    /// A sender that discards everything.
    pub fn disabled() -> Self {
        EventSender {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: FuzzEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // Nobody is listening anymore.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Events lost to a full buffer so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(iteration: u64) -> FuzzEvent {
        FuzzEvent::Progress(ProgressRecord {
            iteration,
            corpus_size: 1,
            unique_crashes: 0,
            elapsed: Duration::ZERO,
        })
    }

    #[test]
    fn full_buffer_drops_and_counts_instead_of_blocking() {
        let (sender, rx) = EventSender::channel(2);
        for i in 0..5 {
            sender.emit(progress(i));
        }
        assert_eq!(sender.dropped(), 3);
        let received: Vec<u64> = rx
            .try_iter()
            .map(|event| match event {
                FuzzEvent::Progress(p) => p.iteration,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(received, vec![0, 1]);
    }

    #[test]
    fn clones_share_the_drop_counter() {
        let (sender, _rx) = EventSender::channel(1);
        let clone = sender.clone();
        sender.emit(progress(0));
        clone.emit(progress(1));
        assert_eq!(sender.dropped(), 1);
        assert_eq!(clone.dropped(), 1);
    }

    #[test]
    fn disabled_and_disconnected_senders_are_silent() {
        let disabled = EventSender::disabled();
        disabled.emit(progress(0));
        assert_eq!(disabled.dropped(), 0);

        let (sender, rx) = EventSender::channel(4);
        drop(rx);
        sender.emit(progress(0));
        assert_eq!(sender.dropped(), 0);
    }
}
