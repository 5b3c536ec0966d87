//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Mainline krpc crate error enum.
pub enum Error {
    /// Id is expected to by [ID_SIZE](crate::common::ID_SIZE) bytes by default,
    /// or [Config::id_length](crate::rpc::Config::id_length) when configured.
    #[error("Invalid Id size, expected a non-empty id, got {0} bytes")]
    InvalidIdSize(usize),

    /// An Id did not match the identifier length configured for this deployment.
    #[error("Invalid Id length, expected {expected} bytes, got {actual}")]
    InvalidIdLength {
        /// Configured identifier length.
        expected: usize,
        /// Length of the rejected identifier.
        actual: usize,
    },

    /// Failed to parse an Id from a hex string.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdHex(String),

    /// A configuration value that must be positive was zero.
    #[error("Invalid configuration: {0} must be greater than zero")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
