// dpau: HTTP API

pub mod handlers;
pub mod models;
pub mod server;

pub use server::{router, serve, AppState};
