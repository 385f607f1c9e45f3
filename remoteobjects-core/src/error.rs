use thiserror::Error;

/// Failure taxonomy shared by the registry, the endpoint handlers and the
/// client proxies.
///
/// `Display` renders the exact `"<Kind>: <message>"` text that travels in
/// the wire error envelope, and [`Error::from_envelope`] parses it back on
/// the receiving side, so both ends of the protocol see typed errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("UnknownClass: {0}")]
    UnknownClass(String),

    #[error("UnknownObject: {0}")]
    UnknownObject(String),

    #[error("UnknownAttribute: {0}")]
    UnknownAttribute(String),

    #[error("MissingArgument: {0}")]
    MissingArgument(String),

    #[error("UnexpectedArgument: {0}")]
    UnexpectedArgument(String),

    #[error("NonPrimitiveAssignment: {0}")]
    NonPrimitiveAssignment(String),

    #[error("IdCollision: {0}")]
    IdCollision(String),

    #[error("ArgumentBindingError: {0}")]
    ArgumentBinding(String),

    /// Wraps a failure raised by a hosted class's own constructor.
    #[error("ConstructionError: {0}")]
    Construction(String),

    #[error("UploadRejected: {0}")]
    UploadRejected(String),

    #[error("VersionMismatch: {0}")]
    VersionMismatch(String),

    /// Non-2xx response or connection failure not otherwise classified.
    #[error("TransportError: {0}")]
    Transport(String),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnknownClass(_) => "UnknownClass",
            Error::UnknownObject(_) => "UnknownObject",
            Error::UnknownAttribute(_) => "UnknownAttribute",
            Error::MissingArgument(_) => "MissingArgument",
            Error::UnexpectedArgument(_) => "UnexpectedArgument",
            Error::NonPrimitiveAssignment(_) => "NonPrimitiveAssignment",
            Error::IdCollision(_) => "IdCollision",
            Error::ArgumentBinding(_) => "ArgumentBindingError",
            Error::Construction(_) => "ConstructionError",
            Error::UploadRejected(_) => "UploadRejected",
            Error::VersionMismatch(_) => "VersionMismatch",
            Error::Transport(_) => "TransportError",
        }
    }

    /// Reconstruct a typed error from envelope text. Unrecognized kinds
    /// fall back to [`Error::Transport`] carrying the full text.
    pub fn from_envelope(text: &str) -> Self {
        let Some((kind, message)) = text.split_once(": ") else {
            return Error::Transport(text.to_string());
        };
        let message = message.to_string();
        match kind {
            "UnknownClass" => Error::UnknownClass(message),
            "UnknownObject" => Error::UnknownObject(message),
            "UnknownAttribute" => Error::UnknownAttribute(message),
            "MissingArgument" => Error::MissingArgument(message),
            "UnexpectedArgument" => Error::UnexpectedArgument(message),
            "NonPrimitiveAssignment" => Error::NonPrimitiveAssignment(message),
            "IdCollision" => Error::IdCollision(message),
            "ArgumentBindingError" => Error::ArgumentBinding(message),
            "ConstructionError" => Error::Construction(message),
            "UploadRejected" => Error::UploadRejected(message),
            "VersionMismatch" => Error::VersionMismatch(message),
            "TransportError" => Error::Transport(message),
            _ => Error::Transport(text.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_text_round_trips() {
        let err = Error::UnknownObject("no registered object for `Dummy#7`".to_string());
        let envelope = err.to_string();
        assert_eq!(envelope, "UnknownObject: no registered object for `Dummy#7`");
        assert_eq!(Error::from_envelope(&envelope), err);
    }

    #[test]
    fn unrecognized_kind_falls_back_to_transport() {
        let err = Error::from_envelope("SomethingElse: boom");
        assert_eq!(err, Error::Transport("SomethingElse: boom".to_string()));
    }

    #[test]
    fn plain_text_falls_back_to_transport() {
        let err = Error::from_envelope("connection reset");
        assert_eq!(err, Error::Transport("connection reset".to_string()));
    }
}
