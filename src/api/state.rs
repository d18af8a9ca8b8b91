use tokio::sync::watch;

use crate::engine::StatusSnapshot;

#[derive(Clone)]
pub struct AppState {
    pub status: watch::Receiver<StatusSnapshot>,
}
