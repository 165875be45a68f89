pub mod apps;
pub mod auth;
pub mod guard;
pub mod reviews;
pub mod theme;
pub mod upload;
