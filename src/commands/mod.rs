//! Commands exposed to the frontend.
//!
//! Each command takes the shared `AppState` and returns `Result<T, String>`
//! so errors cross the UI boundary as display text. Stream output is not
//! returned here; it arrives on the push channel (see `events`).

pub mod chat;
pub mod events;
pub mod mcp;
pub mod settings;

/// Cancel every stream and close every MCP connection.
pub async fn shutdown(state: &crate::AppState) -> Result<(), String> {
    state.shutdown().await;
    Ok(())
}
