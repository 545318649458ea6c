pub mod agent;
pub mod server;

use tokio_util::sync::CancellationToken;

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// A token cancelled on SIGINT or SIGTERM.
pub fn shutdown_token() -> Result<CancellationToken, ctrlc::Error> {
    let token = CancellationToken::new();
    let handle = token.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        handle.cancel();
    })?;
    Ok(token)
}
