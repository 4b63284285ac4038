#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("connection error: {0}")]
    Connection(#[from] server_connection::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;
