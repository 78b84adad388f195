use thiserror::Error;

/// Failure classes from the packet decoding pipeline.
///
/// A malformed packet (bad FourCC, truncated header, a sub-stream whose
/// declared length doesn't fit the packet) is recoverable at the
/// per-packet granularity: the caller gets `Err` for that one packet and
/// may continue with the next. `MissingReference` and `CorruptPlane` are
/// recoverable at an even finer granularity -- a missing reference skips
/// just the offending picture (the decoder does not clear what reference
/// it already has), and a corrupt plane zeroes just that plane's
/// coefficients so the rest of the frame still reconstructs -- so
/// `decoder::Decoder::decode` constructs and logs these rather than
/// returning them as `Err`, matching the recovery behavior spec'd for
/// them. Configuration errors are fatal to the owning encoder or decoder
/// instance.
#[derive(Debug, Error)]
pub enum DsvError {
    #[error("malformed packet: {reason}")]
    MalformedPacket { reason: &'static str },

    #[error("picture packet has_ref=1 but no reference frame is stored")]
    MissingReference,

    #[error("corrupt plane {plane}: {reason}")]
    CorruptPlane { plane: usize, reason: &'static str },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type DsvResult<T> = Result<T, DsvError>;
