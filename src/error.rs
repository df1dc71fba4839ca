pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug)]
pub enum Error {
    /// No record with this id exists in the backend.
    NotFound { id: String },
    /// A stored record (or one of its base64 fields) could not be decoded.
    Decode { what: String, message: String },
    /// The backend itself failed: disk, SQLite, object store.
    Storage { context: String, source: BoxError },
    /// Caller input rejected before touching any backend.
    Validation(String),
    /// A file stream supplied at capture time could not be read or rewound.
    Encoding {
        field: String,
        source: std::io::Error,
    },
}

impl Error {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn decode(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            what: what.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Storage {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Decode { .. } => "decode",
            Self::Storage { .. } => "storage",
            Self::Validation(_) => "validation",
            Self::Encoding { .. } => "encoding",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "request `{id}` was not found"),
            Self::Decode { what, message } => write!(f, "decode {what}: {message}"),
            Self::Storage { context, source } => write!(f, "{context}: {source}"),
            Self::Validation(message) => f.write_str(message),
            Self::Encoding { field, source } => {
                write!(f, "read content of file field `{field}`: {source}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source.as_ref()),
            Self::Encoding { source, .. } => Some(source),
            Self::NotFound { .. } | Self::Decode { .. } | Self::Validation(_) => None,
        }
    }
}

pub(crate) fn join_error(context: &str, err: tokio::task::JoinError) -> Error {
    Error::storage(format!("join {context} task"), err)
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn display_messages_name_the_failing_piece() {
        assert_eq!(
            Error::not_found("abc").to_string(),
            "request `abc` was not found"
        );
        assert_eq!(
            Error::decode("record 1.json", "expected value").to_string(),
            "decode record 1.json: expected value"
        );
        let err = Error::storage(
            "write record file",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert_eq!(err.to_string(), "write record file: disk full");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(Error::validation("bad").kind(), "validation");
        assert!(Error::not_found("x").is_not_found());
        assert!(!Error::validation("x").is_not_found());
    }
}
