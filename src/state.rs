use crate::config::Settings;
use crate::history::HistoryStore;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub history: Arc<HistoryStore>,
    /// History changes, serialized as JSON, for the `/events` stream.
    pub tx: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(settings: Settings, history: HistoryStore) -> Self {
        let (tx, _) = broadcast::channel(100);
        Self {
            settings,
            history: Arc::new(history),
            tx,
        }
    }
}
