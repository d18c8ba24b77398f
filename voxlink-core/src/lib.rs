//! voxlink-core — real-time voice transport between local audio hardware and
//! a remote voice-assistant service.
//!
//! The pipeline, per direction:
//!
//! ```text
//!  mic ──► SampleRing ──► 48k→16k ──► echo cancel ──► noise gate ──► WebSocket
//!               ▲                          ▲                            │
//!               │                 echo reference                       ▼
//!  speaker ◄── SampleRing ◄── 16k→48k ◄───┴──────── jitter buffer ◄── PCM16
//! ```
//!
//! A call is created over REST, carried over a single WebSocket (binary
//! frames are 16 kHz PCM16 audio, text frames are JSON signaling), and torn
//! down over REST again. [`CallOrchestrator`] drives the whole lifecycle;
//! everything below it is usable on its own.
//!
//! ```no_run
//! use voxlink_core::{CallOrchestrator, SessionConfig};
//!
//! # async fn run() -> voxlink_core::Result<()> {
//! let config = SessionConfig {
//!     api_key: "sk-...".into(),
//!     ..SessionConfig::default()
//! };
//! let call = CallOrchestrator::new(&config);
//! call.start_call("assistant-id").await?;
//! // ... speak ...
//! call.end_call().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod call;
pub mod config;
pub mod dsp;
pub mod error;
pub mod jitter;
pub mod rest;
pub mod transport;

pub use audio::{device::AudioDevices, AudioHandle, AudioIo, AudioStream};
pub use buffering::SampleRing;
pub use call::{CallEvent, CallOrchestrator, CallState, CallStatus};
pub use config::SessionConfig;
pub use error::{CallError, Result};
pub use jitter::JitterStats;
pub use transport::SignalingEvent;
