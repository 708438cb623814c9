use memberguard_core::SessionId;

/// Session context for a request.
///
/// Inserted by the session middleware; present for every route.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionContext {
    session_id: SessionId,
    is_new: bool,
}

impl SessionContext {
    pub fn new(session_id: SessionId, is_new: bool) -> Self {
        Self { session_id, is_new }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether the session was minted for this request (no cookie came in).
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}
