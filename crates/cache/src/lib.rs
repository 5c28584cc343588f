#![forbid(unsafe_code)]

//! Mapa chave/valor em memória com expiração por deadline.
//!
//! Cada entrada recebe um deadline monotônico (`agora + timeout`). Uma task em
//! background dorme até o menor deadline do [`DeadlineIndex`], remove tudo o
//! que venceu e dispara os callbacks de expiração fora do lock.

pub mod clock;
mod entry;
pub mod index;
mod map;
pub mod options;
mod scheduler;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use index::{Bucket, DeadlineIndex};
pub use map::ExpiringMap;
pub use options::{CallOptions, DebugSink, ExpireCallback, Newer, Options};
pub use ttlmap_common::{CacheError, CacheResult, ConsistencyError, DEFAULT_TIMEOUT};
