use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::protocol::{MAX_STRING_SIZE, TOMBSTONE};
use crate::{KvsError, Result};

/// Number of hash buckets. Each bucket carries its own lock.
pub const BUCKET_COUNT: usize = 32;

/// Rendered next to a key that a READ did not find.
const READ_MISS: &str = "KVSERROR";

/// Rendered next to a key that a DELETE did not find.
const DELETE_MISS: &str = "KVSMISSING";

/// Receiver for store mutations.
///
/// Registered once at boot; the store itself knows nothing about
/// sessions or pipes. Deletes are reported with [`TOMBSTONE`] as the
/// value.
pub trait UpdateListener: Send + Sync {
    /// Called after a write or delete is visible to readers.
    fn key_updated(&self, key: &str, value: &str);
}

#[derive(Debug)]
struct Entry {
    key: String,
    value: String,
}

/// In-memory key-value table with per-bucket locking.
///
/// Multi-key operations take the locks of every referenced bucket in
/// ascending index order (each at most once), so concurrent batches
/// cannot deadlock. `show` and [`Store::serialize`] take all bucket
/// locks the same way and therefore observe a consistent snapshot.
pub struct Store {
    buckets: Vec<Mutex<Vec<Entry>>>,
    listener: OnceLock<Box<dyn UpdateListener>>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Store {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
            listener: OnceLock::new(),
        }
    }

    /// Registers the mutation listener. Later calls are ignored.
    pub fn set_listener(&self, listener: Box<dyn UpdateListener>) {
        let _ = self.listener.set(listener);
    }

    fn bucket_of(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % BUCKET_COUNT as u64) as usize
    }

    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() || key.len() > MAX_STRING_SIZE {
            return Err(KvsError::InvalidKey);
        }
        Ok(())
    }

    /// Locks the buckets for `keys` in ascending index order.
    ///
    /// Returns `(index, guard)` pairs sorted by index; a bucket named
    /// by several keys is locked once.
    fn lock_buckets<'a>(
        &'a self,
        keys: impl Iterator<Item = &'a str>,
    ) -> Vec<(usize, MutexGuard<'a, Vec<Entry>>)> {
        let mut indices: Vec<usize> = keys.map(Store::bucket_of).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .map(|i| (i, self.buckets[i].lock().unwrap()))
            .collect()
    }

    fn lock_all(&self) -> Vec<(usize, MutexGuard<'_, Vec<Entry>>)> {
        (0..BUCKET_COUNT)
            .map(|i| (i, self.buckets[i].lock().unwrap()))
            .collect()
    }

    fn emit(&self, key: &str, value: &str) {
        if let Some(listener) = self.listener.get() {
            listener.key_updated(key, value);
        }
    }

    /// Upserts every pair, then reports each pair in input order.
    ///
    /// All referenced buckets stay locked until the whole batch is
    /// applied, so a concurrent reader sees either none or all of it
    /// per key, never a torn value.
    pub fn write(&self, pairs: &[(String, String)]) -> Result<()> {
        for (key, _) in pairs {
            Store::check_key(key)?;
        }

        let mut guards = self.lock_buckets(pairs.iter().map(|(k, _)| k.as_str()));
        for (key, value) in pairs {
            let bucket = Store::bucket_of(key);
            let pos = guards.binary_search_by_key(&bucket, |(i, _)| *i).unwrap();
            let chain = &mut *guards[pos].1;
            match chain.iter_mut().find(|e| e.key == *key) {
                Some(entry) => entry.value = value.clone(),
                None => chain.push(Entry {
                    key: key.clone(),
                    value: value.clone(),
                }),
            }
        }
        drop(guards);

        // Locks are released first: a subscriber that reads on receipt
        // of the notification must observe the new value.
        for (key, value) in pairs {
            self.emit(key, value);
        }
        Ok(())
    }

    /// Renders `[(k,v)(k,KVSERROR)...]` for `keys`, in input order.
    pub fn read(&self, keys: &[String], out: &mut impl Write) -> Result<()> {
        for key in keys {
            Store::check_key(key)?;
        }

        let guards = self.lock_buckets(keys.iter().map(String::as_str));
        let mut line = Vec::with_capacity(keys.len() * MAX_STRING_SIZE);
        line.push(b'[');
        for key in keys {
            let bucket = Store::bucket_of(key);
            let pos = guards.binary_search_by_key(&bucket, |(i, _)| *i).unwrap();
            match guards[pos].1.iter().find(|e| e.key == *key) {
                Some(entry) => write!(line, "({},{})", key, entry.value)?,
                None => write!(line, "({key},{READ_MISS})")?,
            }
        }
        line.extend_from_slice(b"]\n");
        drop(guards);

        out.write_all(&line)?;
        Ok(())
    }

    /// Removes `keys`; misses are rendered as `[(k,KVSMISSING)...]`.
    ///
    /// Only keys that actually held an entry produce a tombstone
    /// notification; deleting an absent key is not a mutation.
    pub fn delete(&self, keys: &[String], out: &mut impl Write) -> Result<()> {
        for key in keys {
            Store::check_key(key)?;
        }

        let mut guards = self.lock_buckets(keys.iter().map(String::as_str));
        let mut removed: Vec<&String> = Vec::new();
        let mut misses = Vec::new();
        for key in keys {
            let bucket = Store::bucket_of(key);
            let pos = guards.binary_search_by_key(&bucket, |(i, _)| *i).unwrap();
            let chain = &mut *guards[pos].1;
            match chain.iter().position(|e| e.key == *key) {
                Some(at) => {
                    chain.swap_remove(at);
                    removed.push(key);
                }
                None => {
                    if misses.is_empty() {
                        misses.push(b'[');
                    }
                    write!(misses, "({key},{DELETE_MISS})")?;
                }
            }
        }
        drop(guards);

        if !misses.is_empty() {
            misses.extend_from_slice(b"]\n");
            out.write_all(&misses)?;
        }
        for key in removed {
            self.emit(key, TOMBSTONE);
        }
        Ok(())
    }

    /// Emits every `(k,v)` pair as one line per entry.
    ///
    /// The order is unspecified but the image is consistent: all bucket
    /// locks are held for the duration of the call.
    pub fn show(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(&self.render_all()?)?;
        Ok(())
    }

    /// Renders the full `(k,v)\n` image into a buffer.
    ///
    /// Used by `show` and by the snapshot path, which must finish the
    /// in-memory pass before forking.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.render_all()?)
    }

    fn render_all(&self) -> Result<Vec<u8>> {
        let guards = self.lock_all();
        let mut image = Vec::new();
        for (_, chain) in &guards {
            for entry in chain.iter() {
                writeln!(image, "({},{})", entry.key, entry.value)?;
            }
        }
        Ok(image)
    }

    /// Non-mutating existence test, used by SUBSCRIBE.
    pub fn check(&self, key: &str) -> bool {
        if Store::check_key(key).is_err() {
            return false;
        }
        let chain = self.buckets[Store::bucket_of(key)].lock().unwrap();
        chain.iter().any(|e| e.key == key)
    }

    /// Fetches a single value, cloning it out of the bucket.
    pub fn get(&self, key: &str) -> Option<String> {
        let chain = self.buckets[Store::bucket_of(key)].lock().unwrap();
        chain.iter().find(|e| e.key == key).map(|e| e.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, String)>>,
    }

    impl UpdateListener for Recorder {
        fn key_updated(&self, key: &str, value: &str) {
            self.events
                .lock()
                .unwrap()
                .push((key.to_owned(), value.to_owned()));
        }
    }

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn write_then_read_renders_pairs_in_input_order() {
        let store = Store::new();
        store.write(&pairs(&[("b", "2"), ("a", "1")])).unwrap();

        let mut out = Vec::new();
        store.read(&keys(&["a", "b", "gone"]), &mut out).unwrap();
        assert_eq!(out, b"[(a,1)(b,2)(gone,KVSERROR)]\n");
    }

    #[test]
    fn overwrite_keeps_one_entry_per_key() {
        let store = Store::new();
        store.write(&pairs(&[("k", "v1")])).unwrap();
        store.write(&pairs(&[("k", "v2")])).unwrap();

        assert_eq!(store.get("k"), Some("v2".to_owned()));
        let mut out = Vec::new();
        store.show(&mut out).unwrap();
        assert_eq!(out, b"(k,v2)\n");
    }

    #[test]
    fn delete_renders_only_misses() {
        let store = Store::new();
        store.write(&pairs(&[("k", "v")])).unwrap();

        let mut out = Vec::new();
        store.delete(&keys(&["k", "absent"]), &mut out).unwrap();
        assert_eq!(out, b"[(absent,KVSMISSING)]\n");
        assert_eq!(store.get("k"), None);

        // A delete with no misses writes nothing at all.
        store.write(&pairs(&[("k", "v")])).unwrap();
        let mut out = Vec::new();
        store.delete(&keys(&["k"]), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn deleted_key_reads_as_a_miss() {
        let store = Store::new();
        store.write(&pairs(&[("k", "v")])).unwrap();
        let mut sink = Vec::new();
        store.delete(&keys(&["k"]), &mut sink).unwrap();

        let mut out = Vec::new();
        store.read(&keys(&["k"]), &mut out).unwrap();
        assert_eq!(out, b"[(k,KVSERROR)]\n");
    }

    #[test]
    fn check_reports_existence_without_mutating() {
        let store = Store::new();
        assert!(!store.check("k"));
        store.write(&pairs(&[("k", "v")])).unwrap();
        assert!(store.check("k"));
        assert!(!store.check(""));
    }

    #[test]
    fn empty_key_is_rejected() {
        let store = Store::new();
        assert!(matches!(
            store.write(&pairs(&[("", "v")])),
            Err(KvsError::InvalidKey)
        ));
        let long = "x".repeat(MAX_STRING_SIZE + 1);
        assert!(matches!(
            store.write(&[(long, "v".to_owned())]),
            Err(KvsError::InvalidKey)
        ));
    }

    #[test]
    fn listener_sees_writes_and_tombstones_but_not_missed_deletes() {
        use std::sync::Arc;

        impl UpdateListener for Arc<Recorder> {
            fn key_updated(&self, key: &str, value: &str) {
                Recorder::key_updated(self, key, value);
            }
        }

        let store = Store::new();
        let recorder = Arc::new(Recorder::default());
        store.set_listener(Box::new(recorder.clone()));

        // Both pairs of the batch are reported even though v1 was
        // overwritten before the bucket locks were released.
        store.write(&pairs(&[("k", "v1"), ("k", "v2")])).unwrap();
        let mut sink = Vec::new();
        store.delete(&keys(&["k", "ghost"]), &mut sink).unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                ("k".to_owned(), "v1".to_owned()),
                ("k".to_owned(), "v2".to_owned()),
                ("k".to_owned(), TOMBSTONE.to_owned()),
            ]
        );
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn show_stays_consistent_under_concurrent_writers() {
        use rand::Rng;

        let store = Store::new();
        crossbeam_utils::thread::scope(|scope| {
            for worker in 0..4 {
                let store = &store;
                scope.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    for i in 0..100 {
                        let key = format!("k{}", rng.gen_range(0..20));
                        store.write(&[(key, format!("w{worker}i{i}"))]).unwrap();
                    }
                });
            }
        })
        .unwrap();

        // Every key appears at most once, holding some written value.
        let mut out = Vec::new();
        store.show(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut seen = std::collections::HashSet::new();
        for line in text.lines() {
            let (key, value) = line
                .strip_prefix('(')
                .and_then(|l| l.strip_suffix(')'))
                .and_then(|l| l.split_once(','))
                .expect("show emits (key,value) lines");
            assert!(seen.insert(key.to_owned()), "duplicate key in show output");
            assert!(value.starts_with('w'));
        }
        assert!(seen.len() <= 20);
    }
}
