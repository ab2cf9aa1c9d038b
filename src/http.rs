use reqwest::Client;
use std::time::Duration;

use crate::config::env_or;

/// Shared client for the row store and the completion gateway.
///
/// The request timeout bounds every outbound call; the classifier adds its own
/// per-attempt bound on top of this.
pub fn build_client() -> Client {
    let timeout: u64 = env_or("HTTP_TIMEOUT_SECS", 15);
    let connect: u64 = env_or("HTTP_CONNECT_TIMEOUT_SECS", 5);
    build_client_with(Duration::from_secs(timeout), Duration::from_secs(connect))
}

pub fn build_client_with(timeout: Duration, connect: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}
