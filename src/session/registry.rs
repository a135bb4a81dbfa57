use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use super::client::{SessionDeps, VoiceSession};
use super::state::SessionEvent;

/// Holds the one live session of the process.
#[derive(Default)]
pub struct SessionRegistry {
    slot: Mutex<Option<Arc<VoiceSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tears down the current session, if any, then installs a new one.
    pub async fn create(&self, deps: SessionDeps) -> (Arc<VoiceSession>, mpsc::UnboundedReceiver<SessionEvent>) {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            log::info!("Replacing session {}", previous.id());
            previous.disconnect().await;
        }
        let (session, events) = VoiceSession::new(deps);
        let session = Arc::new(session);
        *slot = Some(session.clone());
        (session, events)
    }

    pub async fn current(&self) -> Option<Arc<VoiceSession>> {
        self.slot.lock().await.clone()
    }

    pub async fn shutdown(&self) {
        let previous = self.slot.lock().await.take();
        if let Some(session) = previous {
            session.disconnect().await;
        }
    }
}
