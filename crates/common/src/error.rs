use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Erros das operações do cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("falha ao construir valor: {0}")]
    Construction(#[source] BoxError),
    #[error("timeout inválido: {0:?}")]
    InvalidTimeout(Duration),
    #[error("nenhum runtime tokio ativo")]
    NoRuntime,
}

impl CacheError {
    pub fn construction<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        CacheError::Construction(err.into())
    }
}

/// Violações de consistência entre a tabela de entradas e o índice de deadlines.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("chave {key} sem bucket no deadline {deadline:?}")]
    MissingFromIndex { key: String, deadline: Duration },
    #[error("chave {key} no bucket {deadline:?} sem entrada correspondente")]
    OrphanInIndex { key: String, deadline: Duration },
    #[error("chave {key} no bucket {bucket:?}, mas a entrada expira em {entry:?}")]
    DeadlineMismatch {
        key: String,
        bucket: Duration,
        entry: Duration,
    },
    #[error("bucket vazio no deadline {0:?}")]
    EmptyBucket(Duration),
    #[error("chave {key} aparece em {count} buckets")]
    Duplicate { key: String, count: usize },
}

/// Result type alias.
pub type CacheResult<T> = Result<T, CacheError>;
