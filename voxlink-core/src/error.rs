use thiserror::Error;

/// All errors produced by voxlink-core.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("audio stream is already running")]
    AlreadyRunning,

    #[error("a call is already active")]
    CallActive,

    #[error("no active call")]
    NoActiveCall,

    #[error("transport connect failed: {0}")]
    TransportConnect(String),

    #[error("transport error: {0}")]
    TransportRuntime(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("REST request failed with status {status}: {body}")]
    Rest { status: u16, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CallError>;
