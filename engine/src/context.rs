use std::sync::Arc;

use common::config::Config;
use entity::data::MarketEvent;

use crate::event::EventQueue;

/// State shared by the streaming side and the dispatcher, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub queue: EventQueue<MarketEvent>,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            queue: EventQueue::new(),
        }
    }
}
