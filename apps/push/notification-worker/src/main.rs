//! Push Notification Worker - Entry Point
//!
//! Consumes notification jobs and serves the health endpoints.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    push_notification_worker::run().await
}
