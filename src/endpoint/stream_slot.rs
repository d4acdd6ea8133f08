use log::debug;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

/// What is currently being served for an endpoint
#[derive(Debug)]
pub enum ActiveStream {
    None,
    DirectFile {
        generation: u64,
        token: CancellationToken,
    },
    Transcoder {
        generation: u64,
        token: CancellationToken,
        child: Child,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    None,
    DirectFile,
    Transcoder,
}

/// Handed to the streaming task that owns the generation
#[derive(Debug, Clone)]
pub struct StreamTicket {
    pub generation: u64,
    pub token: CancellationToken,
}

#[derive(Debug)]
struct SlotState {
    active: ActiveStream,
    next_generation: u64,
}

/// Single-occupancy slot for an endpoint's in-flight stream.
///
/// Starting a stream cancels the previous one. Cancelling is valid in every state.
#[derive(Debug)]
pub struct StreamSlot {
    state: Mutex<SlotState>,
}

impl Default for StreamSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                active: ActiveStream::None,
                next_generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin_direct(&self) -> StreamTicket {
        self.begin(|generation, token| ActiveStream::DirectFile { generation, token })
    }

    pub fn begin_transcode(&self, child: Child) -> StreamTicket {
        self.begin(move |generation, token| ActiveStream::Transcoder {
            generation,
            token,
            child,
        })
    }

    fn begin<F>(&self, make: F) -> StreamTicket
    where
        F: FnOnce(u64, CancellationToken) -> ActiveStream,
    {
        let mut state = self.lock();
        Self::terminate(std::mem::replace(&mut state.active, ActiveStream::None));

        state.next_generation += 1;
        let generation = state.next_generation;
        let token = CancellationToken::new();
        state.active = make(generation, token.clone());
        StreamTicket { generation, token }
    }

    /// Stop whatever is active. Returns whether anything was running.
    pub fn cancel(&self) -> bool {
        let previous = std::mem::replace(&mut self.lock().active, ActiveStream::None);
        Self::terminate(previous)
    }

    /// Release the slot at the natural end of a stream. The transcoder child is handed
    /// back for reaping; `None` means a newer stream or a cancel already took over.
    pub fn finish(&self, generation: u64) -> Option<Child> {
        let mut state = self.lock();
        let current = match &state.active {
            ActiveStream::DirectFile { generation: g, .. }
            | ActiveStream::Transcoder { generation: g, .. } => *g,
            ActiveStream::None => return None,
        };
        if current != generation {
            return None;
        }

        match std::mem::replace(&mut state.active, ActiveStream::None) {
            ActiveStream::Transcoder { child, .. } => Some(child),
            _ => None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        match &self.lock().active {
            ActiveStream::None => StreamKind::None,
            ActiveStream::DirectFile { .. } => StreamKind::DirectFile,
            ActiveStream::Transcoder { .. } => StreamKind::Transcoder,
        }
    }

    pub fn transcoder_pid(&self) -> Option<u32> {
        match &self.lock().active {
            ActiveStream::Transcoder { child, .. } => child.id(),
            _ => None,
        }
    }

    fn terminate(active: ActiveStream) -> bool {
        match active {
            ActiveStream::None => false,
            ActiveStream::DirectFile { generation, token } => {
                debug!("✂️  Cancelling direct stream #{}", generation);
                token.cancel();
                true
            }
            ActiveStream::Transcoder {
                generation,
                token,
                mut child,
            } => {
                debug!("✂️  Cancelling transcoder stream #{}", generation);
                token.cancel();
                // Already exited is fine
                let _ = child.start_kill();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[test]
    fn test_cancel_is_idempotent() {
        let slot = StreamSlot::new();
        assert!(!slot.cancel());

        let ticket = slot.begin_direct();
        assert_eq!(slot.kind(), StreamKind::DirectFile);
        assert!(slot.cancel());
        assert!(ticket.token.is_cancelled());
        assert!(!slot.cancel());
        assert_eq!(slot.kind(), StreamKind::None);
    }

    #[test]
    fn test_new_stream_cancels_previous() {
        let slot = StreamSlot::new();
        let first = slot.begin_direct();
        let second = slot.begin_direct();

        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert!(second.generation > first.generation);

        // A stale finish does not release the newer stream
        assert!(slot.finish(first.generation).is_none());
        assert_eq!(slot.kind(), StreamKind::DirectFile);
        slot.finish(second.generation);
        assert_eq!(slot.kind(), StreamKind::None);
    }

    #[tokio::test]
    async fn test_cancel_kills_transcoder() {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let slot = StreamSlot::new();
        let ticket = slot.begin_transcode(child);
        assert!(slot.transcoder_pid().is_some());
        assert_eq!(slot.kind(), StreamKind::Transcoder);

        assert!(slot.cancel());
        assert!(!slot.cancel());
        assert!(ticket.token.is_cancelled());
        assert!(slot.finish(ticket.generation).is_none());
    }

    #[tokio::test]
    async fn test_finish_returns_child_for_reaping() {
        let child = Command::new("true").spawn().unwrap();
        let slot = StreamSlot::new();
        let ticket = slot.begin_transcode(child);

        let mut child = slot.finish(ticket.generation).unwrap();
        assert!(child.wait().await.unwrap().success());
        assert_eq!(slot.kind(), StreamKind::None);
    }
}
