pub use smallvec::{smallvec, SmallVec};

pub mod hashmap {
    pub type HashMap<K, V> = hashbrown::HashMap<K, V, foldhash::fast::RandomState>;
    pub use hashbrown::hash_map::Entry;
}

pub mod hashset {
    pub type HashSet<T> = hashbrown::HashSet<T, foldhash::fast::RandomState>;
}

#[cfg(test)]
mod tests {
    use super::hashmap::{Entry, HashMap};
    use super::hashset::HashSet;

    #[test]
    fn aliases_behave_like_std_collections() {
        let mut map: HashMap<u32, &str> = HashMap::default();
        map.insert(1, "one");
        match map.entry(1) {
            Entry::Occupied(entry) => assert_eq!(*entry.get(), "one"),
            Entry::Vacant(_) => panic!("entry should exist"),
        }

        let set: HashSet<u32> = [3, 1, 3].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
