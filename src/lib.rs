pub mod auth;
pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod guard;
pub mod hub;
pub mod live;
pub mod notify;
pub mod session;
pub mod theme;
pub mod types;

pub use backend::{Backend, HttpBackend, InMemoryBackend};
pub use config::HubConfig;
pub use error::HubError;
pub use hub::Hub;
