use crate::config::HttpConfig;
use reqwest::Client;

/// Outbound client shared by everything that calls the AI provider.
pub fn build_client(config: &HttpConfig) -> Client {
    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(concat!("syllabus-admin-api/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}
