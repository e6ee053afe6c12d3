use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("empty address")]
    Empty,

    #[error("invalid identifier '{ident}' in address '{addr}'")]
    InvalidIdent { addr: String, ident: String },

    #[error("invalid instance key '{key}' in address '{addr}'")]
    InvalidKey { addr: String, key: String },

    #[error("address '{addr}' is not a complete resource instance address")]
    IncompleteResource { addr: String },

    #[error("address '{addr}' has trailing segments after the resource name")]
    TrailingSegments { addr: String },

    #[error("unterminated bracket or quote in address '{addr}'")]
    Unterminated { addr: String },

    #[error("invalid provider instance address '{addr}'")]
    InvalidProvider { addr: String },

    #[error("invalid deposed key '{key}': expected eight lowercase hex digits")]
    InvalidDeposedKey { key: String },
}
