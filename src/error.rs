#[derive(Debug, thiserror::Error)]
pub enum PriqError {
    #[error("Redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("Redis pool setup error: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),
    #[error("Broker protocol error: {0}")]
    Protocol(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Worker task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}
