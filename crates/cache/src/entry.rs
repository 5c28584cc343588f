use std::time::Duration;

use crate::options::ExpireCallback;

/// Entrada no mapa: valor + deadline monotônico + callback de expiração.
pub(crate) struct Entry<K, V> {
    pub value: V,
    pub deadline: Duration,
    pub on_expire: Option<ExpireCallback<K, V>>,
}

impl<K, V> Entry<K, V> {
    pub fn new(value: V, deadline: Duration, on_expire: Option<ExpireCallback<K, V>>) -> Self {
        Self {
            value,
            deadline,
            on_expire,
        }
    }

    /// Já passou do deadline (mesmo que o scheduler ainda não tenha varrido).
    pub fn is_due(&self, now: Duration) -> bool {
        self.deadline <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_at_and_after_deadline() {
        let entry: Entry<u32, &str> = Entry::new("v", Duration::from_millis(10), None);
        assert!(!entry.is_due(Duration::from_millis(9)));
        assert!(entry.is_due(Duration::from_millis(10)));
        assert!(entry.is_due(Duration::from_millis(11)));
    }
}
