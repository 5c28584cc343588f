use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::time::Duration;

use indexmap::IndexSet;

/// Chaves que expiram exatamente no mesmo deadline, em ordem de inserção.
pub type Bucket<K> = IndexSet<K>;

/// Índice ordenado `deadline -> bucket`.
///
/// Nunca guarda buckets vazios: o bucket é criado no primeiro insert e
/// destruído quando a última chave sai.
#[derive(Debug)]
pub struct DeadlineIndex<K> {
    buckets: BTreeMap<Duration, Bucket<K>>,
}

impl<K> DeadlineIndex<K> {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    /// Bucket de menor deadline.
    pub fn leftmost(&self) -> Option<(Duration, &Bucket<K>)> {
        self.buckets.first_key_value().map(|(d, b)| (*d, b))
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.buckets.keys().next().copied()
    }

    /// Última chave do bucket de menor deadline, se ele já venceu.
    pub fn due_key(&self, now: Duration) -> Option<(Duration, &K)> {
        let (deadline, bucket) = self.buckets.first_key_value()?;
        if *deadline > now {
            return None;
        }
        bucket.last().map(|key| (*deadline, key))
    }

    /// Remove e retorna o bucket de menor deadline, se ele já venceu (`deadline <= now`).
    pub fn pop_leftmost_if_due(&mut self, now: Duration) -> Option<(Duration, Bucket<K>)> {
        match self.buckets.first_entry() {
            Some(entry) if *entry.key() <= now => Some(entry.remove_entry()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Duration, &Bucket<K>)> {
        self.buckets.iter().map(|(d, b)| (*d, b))
    }
}

impl<K> DeadlineIndex<K>
where
    K: Hash + Eq,
{
    /// Adiciona `key` ao bucket de `deadline`, criando-o se preciso.
    pub fn insert(&mut self, deadline: Duration, key: K) {
        self.buckets.entry(deadline).or_default().insert(key);
    }

    /// Remove `key` do bucket de `deadline`. Retorna `false` se o par não existia.
    pub fn remove<Q>(&mut self, deadline: Duration, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(bucket) = self.buckets.get_mut(&deadline) else {
            return false;
        };
        let removed = bucket.shift_remove(key);
        if bucket.is_empty() {
            self.buckets.remove(&deadline);
        }
        removed
    }

    /// Tira a chave devolvida por [`DeadlineIndex::due_key`], sem recalcular
    /// o hash dela. Destrói o bucket quando ele esvazia.
    pub fn pop_leftmost_key(&mut self) -> Option<(Duration, K)> {
        let mut entry = self.buckets.first_entry()?;
        let deadline = *entry.key();
        let key = entry.get_mut().pop();
        if entry.get().is_empty() {
            entry.remove();
        }
        key.map(|key| (deadline, key))
    }
}

impl<K> Default for DeadlineIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn insert_creates_and_appends_bucket() {
        let mut index = DeadlineIndex::new();
        index.insert(ms(10), "a");
        index.insert(ms(10), "b");
        index.insert(ms(20), "c");

        assert_eq!(index.len(), 2);
        let (deadline, bucket) = index.leftmost().unwrap();
        assert_eq!(deadline, ms(10));
        assert_eq!(bucket.iter().copied().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn remove_last_key_destroys_bucket() {
        let mut index = DeadlineIndex::new();
        index.insert(ms(10), "a");
        index.insert(ms(20), "b");

        assert!(index.remove(ms(10), &"a"));
        assert_eq!(index.len(), 1);
        assert_eq!(index.next_deadline(), Some(ms(20)));

        assert!(index.remove(ms(20), &"b"));
        assert!(index.is_empty());
        assert!(index.leftmost().is_none());
    }

    #[test]
    fn remove_keeps_bucket_order() {
        let mut index = DeadlineIndex::new();
        for key in ["a", "b", "c"] {
            index.insert(ms(5), key);
        }
        assert!(index.remove(ms(5), &"b"));

        let (_, bucket) = index.leftmost().unwrap();
        assert_eq!(bucket.iter().copied().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn remove_missing_pair_is_noop() {
        let mut index = DeadlineIndex::new();
        index.insert(ms(10), "a");

        assert!(!index.remove(ms(99), &"a"));
        assert!(!index.remove(ms(10), &"z"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn pop_leftmost_only_when_due() {
        let mut index = DeadlineIndex::new();
        index.insert(ms(10), "a");
        index.insert(ms(10), "b");
        index.insert(ms(30), "c");

        assert!(index.pop_leftmost_if_due(ms(9)).is_none());

        let (deadline, bucket) = index.pop_leftmost_if_due(ms(10)).unwrap();
        assert_eq!(deadline, ms(10));
        assert_eq!(bucket.len(), 2);

        assert!(index.pop_leftmost_if_due(ms(25)).is_none());
        assert_eq!(index.next_deadline(), Some(ms(30)));
    }

    #[test]
    fn due_key_then_pop_drains_bucket_from_the_back() {
        let mut index = DeadlineIndex::new();
        index.insert(ms(10), "a");
        index.insert(ms(10), "b");
        index.insert(ms(30), "c");

        assert!(index.due_key(ms(9)).is_none());
        assert_eq!(index.due_key(ms(10)), Some((ms(10), &"b")));
        assert_eq!(index.pop_leftmost_key(), Some((ms(10), "b")));
        assert_eq!(index.due_key(ms(10)), Some((ms(10), &"a")));
        assert_eq!(index.pop_leftmost_key(), Some((ms(10), "a")));

        // Bucket vazio some junto com a última chave.
        assert_eq!(index.len(), 1);
        assert!(index.due_key(ms(10)).is_none());
        assert_eq!(index.next_deadline(), Some(ms(30)));
    }

    #[test]
    fn read_only_methods_need_no_hash_bound() {
        struct Opaque;
        let index: DeadlineIndex<Opaque> = DeadlineIndex::default();
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
        assert!(index.leftmost().is_none());
        assert_eq!(index.iter().count(), 0);
    }
}
