pub mod client;
pub mod poller;
pub mod router;
pub mod types;

pub use client::TelegramClient;
pub use poller::Poller;
