use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("malformed point encoding")]
    MalformedPoint,
    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("keystream key too short: {0} bytes")]
    ShortKey(usize),
    #[error("slot {slot} does not fit in {bits} bits")]
    SlotOutOfRange { slot: usize, bits: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("store: {0}")]
    Store(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn io_conversion_preserves_message() {
        let src = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = src.into();
        match err {
            Error::Io(inner) => assert_eq!(inner.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn length_mismatch_names_both_sides() {
        let msg = Error::LengthMismatch {
            expected: 32,
            actual: 16,
        }
        .to_string();
        assert!(msg.contains("32"));
        assert!(msg.contains("16"));
    }
}
