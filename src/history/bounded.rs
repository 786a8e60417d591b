use std::collections::{ HashMap, VecDeque };
use crate::models::chat::Turn;

/// Capacity-bounded session map with first-in-first-out eviction.
///
/// Overwriting a key keeps its first position in the eviction order.
#[derive(Debug)]
pub struct BoundedSessions {
    capacity: usize,
    entries: HashMap<String, Vec<Turn>>,
    order: VecDeque<String>,
}

impl BoundedSessions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Vec<Turn>> {
        self.entries.get(key)
    }

    /// Inserts or overwrites `key`, returning the keys evicted to make room.
    pub fn insert(&mut self, key: &str, turns: Vec<Turn>) -> Vec<String> {
        if let Some(existing) = self.entries.get_mut(key) {
            *existing = turns;
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    evicted.push(oldest);
                }
                None => break,
            }
        }

        self.entries.insert(key.to_string(), turns);
        self.order.push_back(key.to_string());
        evicted
    }

    /// Live entries, oldest insertion first.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Turn>)> {
        self.order.iter().filter_map(move |key| self.entries.get_key_value(key))
    }
}
