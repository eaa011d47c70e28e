//! Session observation: every state-changing operation reports what it did.
//!
//! Events cross from the responder thread to whoever drains the receiver
//! through a bounded channel; when the consumer falls behind, events are
//! dropped rather than stalling the session.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

/// What just happened on the session, tagged with the paths or progress it
/// concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    OpenSession,
    CloseSession,
    CreateFile { path: String },
    DeleteFile { path: String },
    RenameFile { path: String, new_path: String },
    CreateFolder { path: String },
    DeleteFolder { path: String },
    RenameFolder { path: String, new_path: String },
    ReadBegin { path: String },
    ReadProgress { offset: u64, size: u64 },
    ReadEnd { path: String },
    WriteBegin { path: String },
    WriteProgress { offset: u64, size: u64 },
    WriteEnd { path: String },
}

/// Sending half handed to the server at startup. `EventSink::none()` keeps
/// the responder silent.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<SyncSender<SessionEvent>>,
}

impl EventSink {
    pub fn none() -> Self {
        Self::default()
    }

    /// A sink/receiver pair with room for `capacity` undrained events.
    pub fn channel(capacity: usize) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = sync_channel(capacity);
        (EventSink { tx: Some(tx) }, rx)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::debug!("event queue full, dropping {event:?}");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let (sink, rx) = EventSink::channel(2);
        for i in 0..5 {
            sink.emit(SessionEvent::ReadProgress {
                offset: i,
                size: 1,
            });
        }
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn none_sink_is_inert() {
        EventSink::none().emit(SessionEvent::OpenSession);
    }
}
