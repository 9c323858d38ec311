use std::io::ErrorKind;

use thiserror::Error;

/// All errors produced by tapedeck-core.
#[derive(Debug, Error)]
pub enum TapedeckError {
    #[error("audio host unavailable: {0}")]
    HostUnavailable(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default {0} device found")]
    NoDefaultDevice(&'static str),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid audio source: {0}")]
    InvalidSource(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("worker thread failed: {0}")]
    Worker(String),

    #[error("block only partly written ({written} of {total} samples): {source}")]
    PartialWrite {
        written: usize,
        total: usize,
        #[source]
        source: Box<TapedeckError>,
    },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TapedeckError {
    /// Whether a write failure may be retried on the next block.
    ///
    /// Disk-full, permission and every other I/O kind end the recording.
    pub fn is_transient(&self) -> bool {
        let kind = match self {
            TapedeckError::Io(e) => e.kind(),
            TapedeckError::Wav(hound::Error::IoError(e)) => e.kind(),
            _ => return false,
        };
        matches!(
            kind,
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
        )
    }
}

pub type Result<T> = std::result::Result<T, TapedeckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_writes_are_transient() {
        let err = TapedeckError::Io(std::io::Error::from(ErrorKind::Interrupted));
        assert!(err.is_transient());
        let err = TapedeckError::Wav(hound::Error::IoError(std::io::Error::from(
            ErrorKind::TimedOut,
        )));
        assert!(err.is_transient());
    }

    #[test]
    fn disk_full_and_permission_errors_are_fatal() {
        let denied = TapedeckError::Io(std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(!denied.is_transient());
        let full = TapedeckError::Io(std::io::Error::other("No space left on device"));
        assert!(!full.is_transient());
        assert!(!TapedeckError::Wav(hound::Error::TooWide).is_transient());
    }

    #[test]
    fn partial_block_writes_are_fatal_even_when_the_cause_is_not() {
        let err = TapedeckError::PartialWrite {
            written: 3,
            total: 4,
            source: Box::new(TapedeckError::Io(std::io::Error::from(ErrorKind::TimedOut))),
        };
        assert!(!err.is_transient());
    }
}
