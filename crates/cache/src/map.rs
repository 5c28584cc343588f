use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, warn};

use ttlmap_common::{CacheError, CacheResult, ConsistencyError};

use crate::clock::{Clock, MonotonicClock};
use crate::entry::Entry;
use crate::index::DeadlineIndex;
use crate::options::{CallOptions, Options};
use crate::scheduler::{self, Expired, SchedulerHandle};

/// Tabela de entradas + índice de deadlines, sempre mutados juntos sob o mesmo lock.
pub(crate) struct State<K, V> {
    pub entries: HashMap<K, Entry<K, V>>,
    pub index: DeadlineIndex<K>,
    /// Próximo instante em que o scheduler planeja acordar.
    pub next_wake: Duration,
}

/// Estado compartilhado entre os handles do mapa e o scheduler.
pub(crate) struct Shared<K, V> {
    pub state: RwLock<State<K, V>>,
    pub options: Options<K, V>,
    pub clock: Arc<dyn Clock>,
    pub wake: Notify,
    pub runtime: Handle,
    pub restarts: AtomicU64,
}

impl<K, V> Shared<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Insere uma entrada nova nas duas estruturas. Retorna `true` se o scheduler
    /// precisa ser acordado (deadline anterior ao próximo despertar planejado).
    fn insert(
        &self,
        state: &mut State<K, V>,
        key: K,
        value: V,
        now: Duration,
        opts: &Options<K, V>,
    ) -> bool {
        let deadline = now.checked_add(opts.timeout).unwrap_or(Duration::MAX);
        state.index.insert(deadline, key.clone());
        state
            .entries
            .insert(key, Entry::new(value, deadline, opts.on_expire.clone()));
        opts.debug(format_args!("entrada inserida com deadline {deadline:?}"));

        if deadline < state.next_wake {
            state.next_wake = deadline;
            return true;
        }
        false
    }

    /// Remove a chave das duas estruturas.
    ///
    /// Nenhuma das duas é alterada antes de a chave ser localizada em ambas:
    /// um `Hash` que entra em pânico deixa o par intacto.
    fn detach<Q>(&self, state: &mut State<K, V>, key: &Q) -> Option<(K, Entry<K, V>)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let deadline = state.entries.get(key)?.deadline;
        if !state.index.remove(deadline, key) {
            warn!("índice inconsistente: chave ausente do bucket {deadline:?}");
            self.options.debug(format_args!(
                "índice inconsistente: chave ausente do bucket {deadline:?}"
            ));
        }
        state.entries.remove_entry(key)
    }

    /// Se a entrada já venceu mas ainda não foi varrida, trata como expirada.
    fn evict_due<Q>(
        &self,
        state: &mut State<K, V>,
        key: &Q,
        now: Duration,
        expired: &mut Vec<Expired<K, V>>,
    ) where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let due = state.entries.get(key).is_some_and(|e| e.is_due(now));
        if due && let Some((key, entry)) = self.detach(state, key) {
            expired.push(Expired::new(key, entry));
        }
    }

    /// Remove todos os buckets vencidos e recalcula o próximo despertar.
    ///
    /// Retorna as entradas removidas e quanto tempo o scheduler deve dormir.
    pub fn sweep(&self) -> (Vec<Expired<K, V>>, Duration) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let now = self.clock.now();
        let mut expired = Vec::new();

        // A chave sai da tabela antes do índice: se o `Hash` dela entrar em
        // pânico, o par continua nas duas estruturas e a próxima volta tenta
        // de novo.
        while let Some((deadline, key)) = state.index.due_key(now) {
            let entry = state.entries.remove(key);
            let Some((_, key)) = state.index.pop_leftmost_key() else {
                break;
            };
            match entry {
                Some(entry) => expired.push(Expired::new(key, entry)),
                None => {
                    warn!("bucket {deadline:?} continha chave sem entrada");
                    self.options.debug(format_args!(
                        "bucket {deadline:?} continha chave sem entrada"
                    ));
                }
            }
        }

        let next = state
            .index
            .next_deadline()
            .unwrap_or_else(|| now.saturating_add(self.options.timeout));
        state.next_wake = next;
        drop(guard);

        if !expired.is_empty() {
            debug!("{} entradas expiradas removidas", expired.len());
            self.options
                .debug(format_args!("{} entradas expiradas removidas", expired.len()));
        }

        (expired, next.saturating_sub(now))
    }

    /// Pós-escrita, já fora do lock: acorda o scheduler e despacha expirações.
    fn after_write(&self, wake: bool, expired: Vec<Expired<K, V>>) {
        if wake {
            self.wake.notify_one();
        }
        scheduler::dispatch(&self.runtime, expired);
    }
}

/// Mapa chave/valor em memória onde toda entrada tem um deadline.
///
/// Entradas vencidas são removidas por uma task em background, que chama o
/// callback de expiração configurado (sempre fora do lock, em uma task própria).
/// O handle é barato de clonar; quando o último clone é dropado o scheduler para.
///
/// Um `store` concorrente a um callback de expiração da mesma chave não é
/// sincronizado com ele: o último a escrever vence.
///
/// Um callback que captura um clone do próprio mapa forma um ciclo de `Arc`
/// (opções e entradas apontam para o mapa, que aponta para elas). Nesse caso
/// o drop do último clone externo não para o scheduler: chame
/// [`ExpiringMap::close`] explicitamente.
pub struct ExpiringMap<K, V> {
    shared: Arc<Shared<K, V>>,
    handle: Arc<SchedulerHandle>,
}

impl<K, V> Clone for ExpiringMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Cria o mapa e inicia o scheduler no runtime tokio corrente.
    pub fn new(options: Options<K, V>) -> CacheResult<Self> {
        Self::with_clock(options, MonotonicClock::new())
    }

    /// Como [`ExpiringMap::new`], com um relógio injetado.
    pub fn with_clock<C>(options: Options<K, V>, clock: C) -> CacheResult<Self>
    where
        C: Clock,
    {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let next_wake = clock.now().saturating_add(options.timeout);

        let shared = Arc::new(Shared {
            state: RwLock::new(State {
                entries: HashMap::new(),
                index: DeadlineIndex::new(),
                next_wake,
            }),
            options,
            clock,
            wake: Notify::new(),
            runtime,
            restarts: AtomicU64::new(0),
        });

        let handle = scheduler::spawn(shared.clone());
        Ok(Self {
            shared,
            handle: Arc::new(handle),
        })
    }

    /// Valor atual da chave. Entradas vencidas contam como ausentes.
    /// Não renova o deadline.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let now = self.shared.clock.now();
        let state = self.shared.state.read();
        state
            .entries
            .get(key)
            .filter(|e| !e.is_due(now))
            .map(|e| e.value.clone())
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.shared.clock.now();
        let state = self.shared.state.read();
        state.entries.get(key).is_some_and(|e| !e.is_due(now))
    }

    /// Retorna o valor existente ou constrói um com a fábrica configurada.
    /// O `bool` indica se a chave já existia.
    ///
    /// A fábrica roda com o lock de escrita tomado: deve ser rápida.
    pub fn load_or_new(&self, key: K) -> (V, bool)
    where
        V: Clone,
    {
        self.load_or_new_with(key, &CallOptions::new())
    }

    pub fn load_or_new_with(&self, key: K, call: &CallOptions<K, V>) -> (V, bool)
    where
        V: Clone,
    {
        let opts = self.shared.options.merged(call);
        let newer = opts.newer.clone();
        match self.load_or_insert_with(key, &opts, |k| Ok::<_, Infallible>(newer(k))) {
            Ok(found) => found,
            Err(never) => match never {},
        }
    }

    /// Variante de `load_or_new` com fábrica falível. Se a fábrica falha nada é
    /// inserido e o erro é propagado.
    pub fn try_load_or_new<F, E>(&self, key: K, factory: F) -> CacheResult<(V, bool)>
    where
        V: Clone,
        F: FnOnce(&K) -> Result<V, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.try_load_or_new_with(key, &CallOptions::new(), factory)
    }

    pub fn try_load_or_new_with<F, E>(
        &self,
        key: K,
        call: &CallOptions<K, V>,
        factory: F,
    ) -> CacheResult<(V, bool)>
    where
        V: Clone,
        F: FnOnce(&K) -> Result<V, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let opts = self.shared.options.merged(call);
        self.load_or_insert_with(key, &opts, factory)
            .map_err(CacheError::construction)
    }

    fn load_or_insert_with<F, E>(
        &self,
        key: K,
        opts: &Options<K, V>,
        factory: F,
    ) -> Result<(V, bool), E>
    where
        V: Clone,
        F: FnOnce(&K) -> Result<V, E>,
    {
        if let Some(value) = self.load(&key) {
            return Ok((value, true));
        }

        let mut expired = Vec::new();
        let (result, wake) = {
            let mut guard = self.shared.state.write();
            let state = &mut *guard;
            let now = self.shared.clock.now();
            self.shared.evict_due(state, &key, now, &mut expired);

            // Outro caller pode ter inserido entre o read e o write lock.
            if let Some(entry) = state.entries.get(&key) {
                (Ok((entry.value.clone(), true)), false)
            } else {
                match factory(&key) {
                    Ok(value) => {
                        let wake = self.shared.insert(state, key, value.clone(), now, opts);
                        (Ok((value, false)), wake)
                    }
                    Err(e) => (Err(e), false),
                }
            }
        };

        self.shared.after_write(wake, expired);
        result
    }

    /// Armazena `value`, substituindo qualquer entrada anterior.
    pub fn store(&self, key: K, value: V) {
        self.store_with(key, value, &CallOptions::new());
    }

    pub fn store_with(&self, key: K, value: V, call: &CallOptions<K, V>) {
        self.swap_with(key, value, call);
    }

    /// Armazena `value` e retorna o valor anterior, se havia um vivo.
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        self.swap_with(key, value, &CallOptions::new())
    }

    pub fn swap_with(&self, key: K, value: V, call: &CallOptions<K, V>) -> Option<V> {
        let opts = self.shared.options.merged(call);
        let mut expired = Vec::new();
        let (old, wake) = {
            let mut guard = self.shared.state.write();
            let state = &mut *guard;
            let now = self.shared.clock.now();
            self.shared.evict_due(state, &key, now, &mut expired);
            let old = self.shared.detach(state, &key).map(|(_, e)| e.value);
            let wake = self.shared.insert(state, key, value, now, &opts);
            (old, wake)
        };

        self.shared.after_write(wake, expired);
        old
    }

    /// Remove a chave. Retorna `true` se havia uma entrada viva.
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.drain(key).is_some()
    }

    /// Remove a chave e retorna o valor, sem disparar o callback de expiração.
    pub fn drain<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut expired = Vec::new();
        let old = {
            let mut guard = self.shared.state.write();
            let state = &mut *guard;
            let now = self.shared.clock.now();
            self.shared.evict_due(state, key, now, &mut expired);
            self.shared.detach(state, key).map(|(_, e)| e.value)
        };

        self.shared.after_write(false, expired);
        old
    }

    /// Executa uma varredura agora, a partir do caller. Retorna quantas entradas expiraram.
    pub fn sweep(&self) -> usize {
        let (expired, _) = self.shared.sweep();
        let count = expired.len();
        scheduler::dispatch(&self.shared.runtime, expired);
        count
    }

    /// Para o scheduler. Idempotente; callbacks já despachados não são cancelados.
    /// O mapa continua legível e gravável, mas sem expiração automática.
    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Quantas vezes o scheduler foi reiniciado após um pânico.
    pub fn scheduler_restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    /// Número de entradas, incluindo vencidas ainda não varridas.
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.read().entries.is_empty()
    }

    /// Menor deadline vivo no índice.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.shared.state.read().index.next_deadline()
    }

    pub fn options(&self) -> &Options<K, V> {
        &self.shared.options
    }

    /// Verifica a consistência entre a tabela de entradas e o índice de deadlines.
    pub fn check_consistency(&self) -> Result<(), ConsistencyError>
    where
        K: fmt::Debug,
    {
        let state = self.shared.state.read();
        let mut seen: HashMap<&K, usize> = HashMap::with_capacity(state.entries.len());

        for (deadline, bucket) in state.index.iter() {
            if bucket.is_empty() {
                return Err(ConsistencyError::EmptyBucket(deadline));
            }
            for key in bucket {
                *seen.entry(key).or_default() += 1;
                match state.entries.get(key) {
                    None => {
                        return Err(ConsistencyError::OrphanInIndex {
                            key: format!("{key:?}"),
                            deadline,
                        });
                    }
                    Some(entry) if entry.deadline != deadline => {
                        return Err(ConsistencyError::DeadlineMismatch {
                            key: format!("{key:?}"),
                            bucket: deadline,
                            entry: entry.deadline,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        if let Some((key, count)) = seen.iter().find(|(_, count)| **count > 1) {
            return Err(ConsistencyError::Duplicate {
                key: format!("{key:?}"),
                count: *count,
            });
        }

        for (key, entry) in &state.entries {
            if !seen.contains_key(key) {
                return Err(ConsistencyError::MissingFromIndex {
                    key: format!("{key:?}"),
                    deadline: entry.deadline,
                });
            }
        }

        Ok(())
    }
}

impl<K, V> fmt::Debug for ExpiringMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("ExpiringMap")
            .field("len", &state.entries.len())
            .field("buckets", &state.index.len())
            .field("next_wake", &state.next_wake)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}
