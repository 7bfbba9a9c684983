use std::time::Duration;

use crate::gestures::{Gesture, default_gestures};

/// Tunables for the verification engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub gestures: Vec<Gesture>,
    /// Commands per identity per minute.
    pub command_limit: usize,
    /// Photo submissions per identity per minute.
    pub photo_limit: usize,
    /// Target of the "Open shop" button sent on approval.
    pub shop_url: Option<String>,
    pub admin_cache_ttl: Duration,
    pub rejection_ttl: Duration,
    /// Maximum number of requests listed by `/pending`.
    pub pending_list_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gestures: default_gestures(),
            command_limit: 10,
            photo_limit: 5,
            shop_url: None,
            admin_cache_ttl: crate::admin_directory::DEFAULT_TTL,
            rejection_ttl: crate::conversation::DEFAULT_TTL,
            pending_list_limit: 10,
        }
    }
}
