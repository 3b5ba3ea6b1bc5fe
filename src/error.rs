/// A fjord error. All consensus operations return these, and they are the
/// only errors surfaced to the containing process.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The operation was aborted, e.g. because the node is shutting down.
    /// The caller should retry against the cluster.
    Abort,
    /// The local node is not the leader. Contains the last known leader, if
    /// any, so the caller can forward the request.
    NotLeader(Option<std::net::SocketAddrV4>),
    /// The commit or apply outcome was not observed within the configured
    /// client-visible bound.
    Timeout,
    /// A durability failure in the log. Fatal: a log that cannot persist
    /// cannot uphold its contract, so the process must stop.
    IO(String),
    /// A structural check failed while reading durable state. Fatal.
    Corrupt(String),
    /// The state machine refused a committed entry. The entry is not
    /// retried; the error is surfaced to the waiting client.
    Rejected(String),
}

/// Constructs an Error::Corrupt via format!() and into().
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

impl Error {
    /// Returns true if the error is unrecoverable and the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::IO(_) | Error::Corrupt(_))
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::NotLeader(Some(leader)) => write!(f, "not the leader, try {leader}"),
            Error::NotLeader(None) => write!(f, "not the leader, and no leader is known"),
            Error::Timeout => write!(f, "commit timed out"),
            Error::IO(s) => write!(f, "io error: {s}"),
            Error::Corrupt(s) => write!(f, "corrupt data: {s}"),
            Error::Rejected(s) => write!(f, "command rejected: {s}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

/// A fjord Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows converting an Error to a Result directly, e.g. in the errcorrupt!
/// macro: return errcorrupt!("invalid header").
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}
