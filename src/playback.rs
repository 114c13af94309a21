//! Play/pause serialization for media sinks.
//!
//! The underlying media runtime rejects a pause issued while a play request
//! is still settling, so both operations go through one async gate: a pause
//! always waits until the pending play has settled (success or rejection),
//! and no two commands ever overlap on the same sink.

use crate::media::{MediaSink, SinkEvent};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a play request failed. Callers retry `Rejected` once after a short
/// delay (autoplay-style policy refusals are frequently transient) before
/// giving up.
#[derive(Debug, Error)]
pub enum PlayError {
    #[error("playback rejected: {0}")]
    Rejected(String),
    #[error("media backend error: {0}")]
    Backend(String),
    #[error("play request did not settle in time")]
    Timeout,
}

#[derive(Debug, Default)]
struct PlaybackToken {
    is_playing: bool,
}

/// Serializes playback commands for one sink at a time.
#[derive(Debug, Default)]
pub struct PlaybackController {
    gate: Mutex<PlaybackToken>,
}

impl PlaybackController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a play and hold the gate until it settles. Returns once the
    /// sink reports playback running, or with a typed error.
    pub async fn safe_play(&self, sink: &mut dyn MediaSink) -> Result<(), PlayError> {
        let mut token = self.gate.lock().await;
        let mut events = sink.subscribe();
        sink.play().map_err(|e| PlayError::Backend(format!("{:#}", e)))?;

        let settled = timeout(SETTLE_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(SinkEvent::Playing) => return Ok(()),
                    Ok(SinkEvent::Error(message)) => return Err(PlayError::Rejected(message)),
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(PlayError::Backend("sink event channel closed".into()))
                    }
                }
            }
        })
        .await
        .unwrap_or(Err(PlayError::Timeout));

        token.is_playing = settled.is_ok();
        settled
    }

    /// Pause the sink. Always runs after any in-flight play has settled;
    /// that play's rejection, if any, belongs to the play caller and is only
    /// logged here.
    pub async fn safe_pause(&self, sink: &mut dyn MediaSink) -> Result<(), PlayError> {
        let mut token = self.gate.lock().await;
        if !token.is_playing {
            tracing::debug!("Pause requested while not playing");
        }
        sink.pause()
            .map_err(|e| PlayError::Backend(format!("{:#}", e)))?;
        token.is_playing = false;
        Ok(())
    }

    pub async fn is_playing(&self) -> bool {
        self.gate.lock().await.is_playing
    }
}
