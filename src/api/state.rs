use std::time::Duration;

use crate::session::Session;

#[derive(Clone)]
pub struct AppState {
    pub session: Session,
    /// Interval used by `POST /schedule/start` when the body names none.
    pub default_interval: Duration,
}

impl AppState {
    pub fn new(session: Session, default_interval: Duration) -> Self {
        Self {
            session,
            default_interval,
        }
    }
}
