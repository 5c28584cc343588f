use std::any::Any;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error};

use ttlmap_common::SCHEDULER_RESTART_BACKOFF;

use crate::entry::Entry;
use crate::map::Shared;
use crate::options::ExpireCallback;

/// Entrada removida por expiração, pronta para o callback.
pub(crate) struct Expired<K, V> {
    key: K,
    value: V,
    on_expire: Option<ExpireCallback<K, V>>,
}

impl<K, V> Expired<K, V> {
    pub fn new(key: K, entry: Entry<K, V>) -> Self {
        Self {
            key,
            value: entry.value,
            on_expire: entry.on_expire,
        }
    }
}

/// Dono do sinal de shutdown do scheduler. O drop equivale a `close()`.
pub(crate) struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
}

impl SchedulerHandle {
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("shutdown do scheduler de expiração solicitado");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Inicia o scheduler supervisionado no runtime do mapa.
pub(crate) fn spawn<K, V>(shared: Arc<Shared<K, V>>) -> SchedulerHandle
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let (shutdown, rx) = watch::channel(false);
    let runtime = shared.runtime.clone();
    runtime.spawn(supervise(shared, rx));
    SchedulerHandle { shutdown }
}

/// Reinicia o loop de expiração se ele entrar em pânico, depois de
/// `SCHEDULER_RESTART_BACKOFF`; termina quando o loop sai limpo (após `close()`).
async fn supervise<K, V>(shared: Arc<Shared<K, V>>, shutdown: watch::Receiver<bool>)
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    loop {
        let task = shared
            .runtime
            .spawn(run(shared.clone(), shutdown.clone()));

        match task.await {
            Ok(()) => {
                debug!("scheduler de expiração encerrado");
                return;
            }
            Err(e) if e.is_panic() => {
                let restarts = shared.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                let payload = e.into_panic();
                let msg = panic_message(&*payload);
                error!("scheduler de expiração falhou: {msg}; reiniciando (#{restarts})");
                shared.options.debug(format_args!(
                    "scheduler de expiração falhou: {msg}; reiniciando (#{restarts})"
                ));
                // Um pânico que se repete a cada varredura não pode virar loop quente.
                tokio::time::sleep(SCHEDULER_RESTART_BACKOFF).await;
            }
            Err(e) => {
                // Runtime encerrando.
                debug!("scheduler de expiração cancelado: {e}");
                return;
            }
        }
    }
}

/// Loop principal: varre o que venceu, despacha callbacks e dorme até o
/// próximo deadline ou até ser acordado por uma escrita.
async fn run<K, V>(shared: Arc<Shared<K, V>>, mut shutdown: watch::Receiver<bool>)
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    loop {
        if *shutdown.borrow() {
            return;
        }

        let (expired, sleep_for) = shared.sweep();
        dispatch(&shared.runtime, expired);

        // Timer e sinal são tratados igual: a próxima volta recalcula tudo a
        // partir do índice.
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shared.wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Dispara cada callback em uma task própria. Pânicos ficam isolados na task.
pub(crate) fn dispatch<K, V>(runtime: &Handle, expired: Vec<Expired<K, V>>)
where
    K: Send + 'static,
    V: Send + 'static,
{
    for Expired {
        key,
        value,
        on_expire,
    } in expired
    {
        let Some(callback) = on_expire else {
            continue;
        };
        runtime.spawn(async move {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(key, value))) {
                error!(
                    "callback de expiração entrou em pânico: {}",
                    panic_message(&*payload)
                );
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "pânico sem mensagem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_variants() {
        let payload: Box<dyn Any + Send> = Box::new("estático");
        assert_eq!(panic_message(&*payload), "estático");

        let payload: Box<dyn Any + Send> = Box::new(String::from("formatado"));
        assert_eq!(panic_message(&*payload), "formatado");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(&*payload), "pânico sem mensagem");
    }

    #[test]
    fn close_is_idempotent() {
        let (shutdown, rx) = watch::channel(false);
        let handle = SchedulerHandle { shutdown };
        assert!(!handle.is_closed());

        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn dispatch_skips_entries_without_callback() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback: ExpireCallback<u32, u32> = Arc::new(move |k: u32, v: u32| {
            let _ = tx.send((k, v));
        });

        let expired = vec![
            Expired {
                key: 1,
                value: 10,
                on_expire: Some(callback.clone()),
            },
            Expired {
                key: 2,
                value: 20,
                on_expire: None,
            },
            Expired {
                key: 3,
                value: 30,
                on_expire: Some(callback),
            },
        ];
        dispatch(&Handle::current(), expired);

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![(1, 10), (3, 30)]);
        assert!(rx.recv().await.is_none());
    }
}
