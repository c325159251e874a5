//! Histórico recente para exibição ao vivo.

use std::collections::VecDeque;

/// Capacidade padrão do histórico de leituras.
pub const DEFAULT_HISTORY_SIZE: usize = 200;

/// Buffer circular de capacidade fixa: ao encher, descarta o mais antigo.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Capacidade mínima é 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Cópia do conteúdo, do mais antigo ao mais recente.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Os últimos `n` itens, em ordem de inserção.
    pub fn recent(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}
