// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use checker_config::SOLVER_MIN_BUCKETS;

use crate::hashcons::{hash_combine, InternKey, Interned};

pub type FrameId = usize;

struct HashEntry<T: InternKey, U> {
    frame: FrameId,
    key: Interned<T>,
    value: U,
}

/// Maps `(frame, interned value)` pairs to backend handles, maintaining a
/// stack of contexts aligned with the underlying solver's push/pop stack.
/// Popping a context removes exactly the entries inserted since the
/// matching push, in time linear in the number removed. Lookups with no
/// pushed context land in a base context that is never popped.
pub struct SolverHashTable<T: InternKey, U> {
    buckets: Vec<Vec<HashEntry<T, U>>>,
    entry_count: usize,
    /// Keys inserted per pushed context, most recent context last.
    contexts: Vec<Vec<(FrameId, Interned<T>)>>,
}

impl<T: InternKey, U: Copy> SolverHashTable<T, U> {
    pub fn new() -> SolverHashTable<T, U> {
        SolverHashTable {
            buckets: Vec::new(),
            entry_count: 0,
            contexts: Vec::new(),
        }
    }

    fn bucket_index(&self, frame: FrameId, key: &Interned<T>) -> usize {
        (hash_combine(frame as u32, key.hash()) as usize) % self.buckets.len()
    }

    pub fn lookup(&mut self, frame: FrameId, key: &Interned<T>) -> Option<U> {
        if self.buckets.is_empty() {
            return None;
        }
        let index = self.bucket_index(frame, key);
        self.buckets[index]
            .iter()
            .find(|entry| entry.frame == frame && entry.key == *key)
            .map(|entry| entry.value)
    }

    /// Insert a value for `(frame, key)`, registering it with the topmost
    /// context so the next pop removes it.
    pub fn insert(&mut self, frame: FrameId, key: Interned<T>, value: U) {
        if self.buckets.is_empty() {
            self.buckets.resize_with(SOLVER_MIN_BUCKETS, Vec::new);
        } else {
            self.check_bucket_count();
        }
        let index = self.bucket_index(frame, &key);
        if let Some(context) = self.contexts.last_mut() {
            context.push((frame, key.clone()));
        }
        self.buckets[index].push(HashEntry { frame, key, value });
        self.entry_count += 1;
    }

    pub fn push_context(&mut self) {
        self.contexts.push(Vec::new());
    }

    /// Pop the topmost context, removing every entry it recorded.
    pub fn pop_context(&mut self) {
        let Some(context) = self.contexts.pop() else {
            return;
        };
        for (frame, key) in context {
            let index = self.bucket_index(frame, &key);
            let bucket = &mut self.buckets[index];
            if let Some(at) = bucket
                .iter()
                .rposition(|entry| entry.frame == frame && entry.key == key)
            {
                bucket.remove(at);
                self.entry_count -= 1;
            }
        }
    }

    /// Visit every entry in the table.
    pub fn visit_each(&self, mut visit: impl FnMut(FrameId, &Interned<T>, U)) {
        for bucket in &self.buckets {
            for entry in bucket {
                visit(entry.frame, &entry.key, entry.value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn len(&self) -> usize {
        self.entry_count
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.entry_count = 0;
        self.contexts.clear();
    }

    fn check_bucket_count(&mut self) {
        let buckets = self.buckets.len();
        if buckets > SOLVER_MIN_BUCKETS && buckets > self.entry_count * 4 {
            self.resize(buckets / 2);
        } else if buckets < self.entry_count {
            self.resize(buckets * 2 + 1);
        }
    }

    fn resize(&mut self, bucket_count: usize) {
        let bucket_count = bucket_count.max(SOLVER_MIN_BUCKETS);
        let mut buckets: Vec<Vec<HashEntry<T, U>>> = Vec::new();
        buckets.resize_with(bucket_count, Vec::new);
        for entry in self.buckets.drain(..).flatten() {
            let index =
                (hash_combine(entry.frame as u32, entry.key.hash()) as usize) % bucket_count;
            buckets[index].push(entry);
        }
        self.buckets = buckets;
    }
}

impl<T: InternKey, U: Copy> Default for SolverHashTable<T, U> {
    fn default() -> Self {
        SolverHashTable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{Exp, Variable};

    fn atom(name: &str) -> Exp {
        Exp::make_var(Variable::make_glob(name))
    }

    #[test]
    fn test_lookup_keyed_by_frame() {
        let mut table: SolverHashTable<crate::ir::ExpKind, usize> = SolverHashTable::new();
        let x = atom("x");
        table.insert(0, x.clone(), 10);
        table.insert(1, x.clone(), 11);
        assert_eq!(table.lookup(0, &x), Some(10));
        assert_eq!(table.lookup(1, &x), Some(11));
        assert_eq!(table.lookup(2, &x), None);
    }

    #[test]
    fn test_pop_context_removes_since_push() {
        let mut table: SolverHashTable<crate::ir::ExpKind, usize> = SolverHashTable::new();
        let base = atom("base");
        table.insert(0, base.clone(), 1);

        table.push_context();
        let a = atom("a");
        let b = atom("b");
        table.insert(0, a.clone(), 2);
        table.push_context();
        table.insert(0, b.clone(), 3);

        table.pop_context();
        assert_eq!(table.lookup(0, &b), None);
        assert_eq!(table.lookup(0, &a), Some(2));

        table.pop_context();
        assert_eq!(table.lookup(0, &a), None);
        // the base context is never popped.
        assert_eq!(table.lookup(0, &base), Some(1));
    }

    #[test]
    fn test_many_entries_resize() {
        let mut table: SolverHashTable<crate::ir::ExpKind, usize> = SolverHashTable::new();
        let atoms: Vec<Exp> = (0..500).map(|i| atom(&format!("v{i}"))).collect();
        table.push_context();
        for (index, exp) in atoms.iter().enumerate() {
            table.insert(index % 7, exp.clone(), index);
        }
        for (index, exp) in atoms.iter().enumerate() {
            assert_eq!(table.lookup(index % 7, exp), Some(index));
        }
        table.pop_context();
        assert!(table.is_empty());
    }
}
