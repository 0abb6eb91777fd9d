pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Keypair error: {0}")]
    Keypair(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Asset account error: {0}")]
    AssetAccount(String),
    #[error("URL parse error")]
    UrlParse(#[from] url::ParseError),
}
