//! Testes de propriedade: sequências arbitrárias de operações mantêm a tabela
//! de entradas e o índice de deadlines consistentes, e o mapa se comporta como
//! um modelo simples baseado em `HashMap`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use ttlmap::{CallOptions, ExpiringMap, ManualClock, Options};

const DEFAULT_MS: u64 = 20;

#[derive(Debug, Clone)]
enum Op {
    Store(u8, u64),
    Swap(u8, u64),
    Delete(u8),
    Drain(u8),
    LoadOrNew(u8),
    Advance(u64),
    Sweep,
}

fn arb_op() -> impl Strategy<Value = Op> {
    let key = 0u8..8;
    prop_oneof![
        (key.clone(), 1u64..50).prop_map(|(k, t)| Op::Store(k, t)),
        (key.clone(), 1u64..50).prop_map(|(k, t)| Op::Swap(k, t)),
        key.clone().prop_map(Op::Delete),
        key.clone().prop_map(Op::Drain),
        key.prop_map(Op::LoadOrNew),
        (0u64..30).prop_map(Op::Advance),
        Just(Op::Sweep),
    ]
}

/// Modelo: chave -> (valor, deadline).
struct Model {
    live: HashMap<u8, (u32, Duration)>,
    now: Duration,
}

impl Model {
    fn take_live(&mut self, k: u8) -> Option<u32> {
        let (v, deadline) = self.live.remove(&k)?;
        (deadline > self.now).then_some(v)
    }

    fn get(&self, k: u8) -> Option<u32> {
        self.live
            .get(&k)
            .filter(|(_, d)| *d > self.now)
            .map(|(v, _)| *v)
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn operations_match_model_and_keep_index_consistent(
        ops in prop::collection::vec(arb_op(), 1..80)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();

        let clock = Arc::new(ManualClock::new());
        let opts = Options::new(|k: &u8| u32::from(*k) * 1000).with_timeout(ms(DEFAULT_MS));
        let map = ExpiringMap::with_clock(opts, clock.clone()).unwrap();
        let mut model = Model { live: HashMap::new(), now: Duration::ZERO };
        let mut next_value = 1u32;

        for op in ops {
            match op {
                Op::Store(k, t) => {
                    let call = CallOptions::new().with_timeout(ms(t));
                    map.store_with(k, next_value, &call);
                    model.live.insert(k, (next_value, model.now + ms(t)));
                    next_value += 1;
                }
                Op::Swap(k, t) => {
                    let call = CallOptions::new().with_timeout(ms(t));
                    let old = map.swap_with(k, next_value, &call);
                    prop_assert_eq!(old, model.take_live(k));
                    model.live.insert(k, (next_value, model.now + ms(t)));
                    next_value += 1;
                }
                Op::Delete(k) => {
                    prop_assert_eq!(map.delete(&k), model.take_live(k).is_some());
                }
                Op::Drain(k) => {
                    prop_assert_eq!(map.drain(&k), model.take_live(k));
                }
                Op::LoadOrNew(k) => {
                    let expected = match model.get(k) {
                        Some(v) => (v, true),
                        None => {
                            let v = u32::from(k) * 1000;
                            model.live.insert(k, (v, model.now + ms(DEFAULT_MS)));
                            (v, false)
                        }
                    };
                    prop_assert_eq!(map.load_or_new(k), expected);
                }
                Op::Advance(n) => {
                    clock.advance(ms(n));
                    model.now += ms(n);
                }
                Op::Sweep => {
                    let now = model.now;
                    let due = model.live.values().filter(|(_, d)| *d <= now).count();
                    model.live.retain(|_, (_, d)| *d > now);
                    prop_assert_eq!(map.sweep(), due);
                }
            }

            prop_assert_eq!(map.check_consistency(), Ok(()));
            prop_assert_eq!(map.len(), model.live.len());
            for k in 0u8..8 {
                prop_assert_eq!(map.load(&k), model.get(k));
            }
        }
    }
}
