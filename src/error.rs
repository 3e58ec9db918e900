/// Error kinds surfaced by the engine, the scheduler and the store.
///
/// Transport layers map these onto their own codes (HTTP status, CLI exit);
/// the variants themselves stay transport-agnostic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} exited with code {code}")]
    Hook { what: String, code: i32 },
}

impl Error {
    pub fn os(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Os {
            context: context.into(),
            source,
        }
    }

    pub fn os_errno(context: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Error::Os {
            context: context.into(),
            source: std::io::Error::from_raw_os_error(errno as i32),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
