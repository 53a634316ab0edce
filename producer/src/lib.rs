//! Frame producers that pull JPEG frames from a network camera and hand them
//! to a [`FrameSink`].

pub mod mjpeg;

use std::time::Duration;
use tracing::{error, info};
use vision_common::config::StreamConfig;
use vision_common::frame::FrameSink;

pub use mjpeg::MjpegParser;

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("unknown stream mode '{0}', expected 'mjpeg' or 'polling'")]
    UnknownMode(String),
    #[error("polling fps must be positive, got {0}")]
    InvalidFps(f64),
}

/// How frames are pulled from the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamMode {
    /// One long-lived `multipart/x-mixed-replace` response.
    Mjpeg,
    /// One GET per frame at a fixed interval.
    Polling { interval: Duration },
}

impl StreamMode {
    pub fn from_config(config: &StreamConfig) -> Result<Self, ProducerError> {
        match config.mode.as_str() {
            "mjpeg" => Ok(Self::Mjpeg),
            "polling" => {
                if !(config.fps.is_finite() && config.fps > 0.0) {
                    return Err(ProducerError::InvalidFps(config.fps));
                }
                Ok(Self::Polling {
                    interval: Duration::from_secs_f64(1.0 / config.fps),
                })
            }
            other => Err(ProducerError::UnknownMode(other.to_string())),
        }
    }
}

/// Run the producer described by `config` until the task is cancelled.
pub async fn run_producer(config: &StreamConfig, sink: &dyn FrameSink) -> Result<(), ProducerError> {
    let mode = StreamMode::from_config(config).inspect_err(|e| {
        error!(error = %e, "invalid stream configuration");
    })?;
    info!(url = config.url, mode = config.mode, "starting frame producer");

    match mode {
        StreamMode::Mjpeg => mjpeg::run_mjpeg_producer(&config.url, sink).await,
        StreamMode::Polling { interval } => {
            mjpeg::run_polling_producer(&config.url, sink, interval).await
        }
    }
    Ok(())
}
