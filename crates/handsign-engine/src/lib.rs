pub mod admin_directory;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod fanout;
pub mod gestures;
pub mod nullables;
pub mod outbox;
pub mod photos;
pub mod ports;
pub mod rate_limit;
pub mod retry;
pub mod sqlite;

pub use config::EngineConfig;
pub use engine::{Collaborators, Initiation, RejectionPrompt, ReviewOutcome, VerificationEngine};
pub use error::{EngineError, PhotoError, StoreError, TransportError};
