use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ttlmap_common::{CacheError, DEFAULT_TIMEOUT};

/// Constrói o valor de uma chave ausente em `load_or_new`.
pub type Newer<K, V> = Arc<dyn Fn(&K) -> V + Send + Sync>;
/// Chamado (fora do lock) quando uma entrada expira.
pub type ExpireCallback<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;
/// Recebe as linhas de diagnóstico do mapa.
pub type DebugSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuração do mapa.
///
/// Os valores do mapa são os padrões; cada chamada pode sobrescrevê-los com
/// [`CallOptions`] sem alterar os padrões.
pub struct Options<K, V> {
    pub(crate) timeout: Duration,
    pub(crate) newer: Newer<K, V>,
    pub(crate) on_expire: Option<ExpireCallback<K, V>>,
    pub(crate) debug: Option<DebugSink>,
}

impl<K, V> Options<K, V> {
    /// Opções com a fábrica `newer` e timeout padrão de 5 minutos.
    pub fn new<F>(newer: F) -> Self
    where
        F: Fn(&K) -> V + Send + Sync + 'static,
    {
        Self {
            timeout: DEFAULT_TIMEOUT,
            newer: Arc::new(newer),
            on_expire: None,
            debug: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_newer<F>(mut self, newer: F) -> Self
    where
        F: Fn(&K) -> V + Send + Sync + 'static,
    {
        self.newer = Arc::new(newer);
        self
    }

    pub fn with_on_expire<F>(mut self, on_expire: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.on_expire = Some(Arc::new(on_expire));
        self
    }

    pub fn with_debug<F>(mut self, debug: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.debug = Some(Arc::new(debug));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.timeout.is_zero() {
            return Err(CacheError::InvalidTimeout(self.timeout));
        }
        Ok(())
    }

    /// Cópia rasa dos padrões com os overrides de `call` aplicados.
    pub fn merged(&self, call: &CallOptions<K, V>) -> Self {
        Self {
            timeout: call.timeout.unwrap_or(self.timeout),
            newer: call.newer.clone().unwrap_or_else(|| self.newer.clone()),
            on_expire: call.on_expire.clone().or_else(|| self.on_expire.clone()),
            debug: call.debug.clone().or_else(|| self.debug.clone()),
        }
    }

    pub(crate) fn debug(&self, args: fmt::Arguments<'_>) {
        if let Some(sink) = &self.debug {
            sink(&args.to_string());
        }
    }
}

impl<K, V> Default for Options<K, V>
where
    K: 'static,
    V: Default + 'static,
{
    /// Fábrica padrão: `V::default()`.
    fn default() -> Self {
        Self::new(|_| V::default())
    }
}

impl<K, V> Clone for Options<K, V> {
    fn clone(&self) -> Self {
        Self {
            timeout: self.timeout,
            newer: self.newer.clone(),
            on_expire: self.on_expire.clone(),
            debug: self.debug.clone(),
        }
    }
}

impl<K, V> fmt::Debug for Options<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("timeout", &self.timeout)
            .field("on_expire", &self.on_expire.is_some())
            .field("debug", &self.debug.is_some())
            .finish_non_exhaustive()
    }
}

/// Overrides de uma única chamada. Campos `None` herdam o padrão do mapa.
pub struct CallOptions<K, V> {
    timeout: Option<Duration>,
    newer: Option<Newer<K, V>>,
    on_expire: Option<ExpireCallback<K, V>>,
    debug: Option<DebugSink>,
}

impl<K, V> CallOptions<K, V> {
    pub fn new() -> Self {
        Self {
            timeout: None,
            newer: None,
            on_expire: None,
            debug: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_newer<F>(mut self, newer: F) -> Self
    where
        F: Fn(&K) -> V + Send + Sync + 'static,
    {
        self.newer = Some(Arc::new(newer));
        self
    }

    pub fn with_on_expire<F>(mut self, on_expire: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.on_expire = Some(Arc::new(on_expire));
        self
    }

    pub fn with_debug<F>(mut self, debug: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.debug = Some(Arc::new(debug));
        self
    }
}

impl<K, V> Default for CallOptions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
