use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::models::{Phase, ResponseKind, SessionSnapshot, SystemResponse};
use crate::services::conversation::{BookingEngine, CallSession};

type SharedSession = Arc<tokio::sync::Mutex<CallSession>>;

#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, SharedSession>,
    by_customer: HashMap<String, String>,
}

/// Live sessions. Each session sits behind its own async lock, so two turns of one session
/// never interleave while different sessions run side by side.
pub struct SessionRegistry {
    engine: Arc<BookingEngine>,
    sessions: Mutex<Sessions>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<BookingEngine>) -> Self {
        Self {
            engine,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions().by_id.get(id).cloned()
    }

    /// Starts a session for `customer` and returns its id with the greeting.
    pub fn open(&self, customer: &str) -> (String, SystemResponse) {
        let session = CallSession::new(self.engine.clone(), customer);
        let id = session.id().to_string();
        let greeting = SystemResponse::new(ResponseKind::Prompt, session.phase(), self.engine.greeting());

        let mut sessions = self.sessions();
        sessions
            .by_id
            .insert(id.clone(), Arc::new(tokio::sync::Mutex::new(session)));
        sessions.by_customer.insert(customer.to_string(), id.clone());
        drop(sessions);

        tracing::info!(session_id = %id, customer, "session opened");
        (id, greeting)
    }

    /// Drops a finished session. Its snapshot lives on in the audit archive.
    fn evict(&self, id: &str) {
        let mut sessions = self.sessions();
        sessions.by_id.remove(id);
        sessions.by_customer.retain(|_, live| live != id);
        drop(sessions);
        tracing::debug!(session_id = %id, "session evicted");
    }

    /// `None` when no live session has this id, including sessions that already ended.
    pub async fn handle(&self, id: &str, utterance: &str) -> Option<SystemResponse> {
        let session = self.get(id)?;
        let mut session = session.lock().await;
        let response = session.handle(utterance).await;
        if session.is_terminal() {
            self.evict(id);
        }
        Some(response)
    }

    /// For channels that only know the caller: continues the caller's live session, or opens
    /// a fresh one when there is none or the last one has ended.
    pub async fn handle_for_customer(&self, customer: &str, utterance: &str) -> (String, SystemResponse) {
        let existing = {
            let sessions = self.sessions();
            let session = sessions
                .by_customer
                .get(customer)
                .and_then(|id| sessions.by_id.get(id))
                .cloned();
            session
        };

        if let Some(session) = existing {
            let mut session = session.lock().await;
            let id = session.id().to_string();
            if !session.is_terminal() {
                let response = session.handle(utterance).await;
                if session.is_terminal() {
                    self.evict(&id);
                }
                return (id, response);
            }
            self.evict(&id);
        }

        let (id, _greeting) = self.open(customer);
        let response = match self.handle(&id, utterance).await {
            Some(response) => response,
            None => SystemResponse::new(ResponseKind::Prompt, Phase::Collecting, self.engine.greeting()),
        };
        (id, response)
    }

    pub async fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        let session = self.get(id)?;
        let session = session.lock().await;
        Some(session.snapshot())
    }

    pub fn len(&self) -> usize {
        self.sessions().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
