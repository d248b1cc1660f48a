//! `argus-node`: a GPS-disciplined SDR capture node for a multi-station
//! TDOA localization network.
//!
//! The binary (`src/main.rs`) is a thin CLI shell around this library's
//! capture engine: [`clock`] computes the synchronized-start deadline,
//! [`tuner`] abstracts the SDR device, [`position`] abstracts the timing
//! reference, [`pipeline`] carries IQ chunks between threads, [`agc`]
//! closes the gain loop, [`writer`] serializes the capture file, and
//! [`orchestrator`] ties all of the above into the state machine that runs
//! one capture end to end.

pub mod agc;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod position;
pub mod rtlsdr;
pub mod tuner;
pub mod tuners;
pub mod writer;

pub use cancel::CancelToken;
pub use config::Config;
pub use error::{ArgusError, Result};
pub use orchestrator::{run_capture, run_capture_with};
pub use rtlsdr::RtlSdr;
