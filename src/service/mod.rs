pub mod api;
pub mod client;
pub mod server;

pub use api::{ServiceError, ServiceState};
pub use client::{ClientError, EventClient};
pub use server::{router, serve, start_server};
