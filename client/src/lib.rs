//! Shutter Capture Library
//!
//! Camera preview pipeline: format negotiation, frame reader lifecycle, NV12
//! to BGR conversion, display marshalling and still photo capture.

pub mod capture;
pub mod config;
pub mod display;

/// Initialize logging.
///
/// Honors `RUST_LOG`, falling back to `shutter_client=debug`. `json` switches
/// to machine-readable output. Safe to call more than once.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shutter_client=debug".into());

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
