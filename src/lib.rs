pub mod channel;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
mod fanout;
mod fdtable;
mod http;
pub mod queue;
mod registry;
pub mod reply;
mod rtsp;

pub use channel::{Channel, normalize_channel_name, resolve_channel_path};
pub use client::{Client, ClientKind, RtspState};
pub use config::UnicastConfig;
pub use engine::{ListenerRole, UnicastEngine};
pub use error::{Result, UnicastError};
