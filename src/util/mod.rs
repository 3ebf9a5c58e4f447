//! Small helpers shared by the config loader and the CLI.
//!
//! - **Relay URLs**: only `ws://` and `wss://` endpoints without credentials
//! - **Text**: width-aware truncation and terminal-safe previews of record content

mod relay_url;
mod text;

pub use relay_url::{validate_relay_url, RelayUrlError};
pub use text::{preview_line, strip_control_chars, truncate_to_width};

/// Current time as a unix timestamp in seconds, the unit records use.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
