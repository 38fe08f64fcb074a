pub mod annotate;
pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod frames;
pub mod model;
pub mod naming;
pub mod singleflight;
pub mod state;
pub mod thumbs;
pub mod upload;

use std::time::{SystemTime, UNIX_EPOCH};

pub use api::build_router;
pub use config::Config;
pub use state::AppState;

pub fn detect_ffmpeg(bin: &str) -> bool {
    let output = std::process::Command::new(bin)
        .arg("-version")
        .output();

    match output {
        Ok(out) => out.status.success(),
        Err(_) => false,
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
