pub mod config;
pub mod error;
pub mod io;
pub mod models;
pub mod progress;
pub mod store;
