//! Keyed, LRU-bounded cache of compiled `Program`s, `Dictionary`s and
//! `Configuration`s, with mtime/size-based invalidation (`spec.md` §4.7,
//! §5).
//!
//! Generalizes the teacher's own process-wide `once_cell`-backed caches
//! (`pipeline/mod.rs`'s `REGEX_CACHE`/`SPLIT_CACHE`, a `Mutex<HashMap<...>>`
//! of one kind of derived artifact) from "cache of regexes" to "cache of
//! compiled templates" — sharded concurrent reads via `dashmap`, a per-key
//! build lock via `parking_lot::Mutex` so duplicate concurrent compiles of
//! the same path collapse into one (`spec.md` §5).
//!
//! Cached handles are `Rc`-based, matching every other collaborator in this
//! crate (`Processor`, `FragmentStack`, `IncludeLoader`) — the VM itself is
//! defined as single-threaded per render (`spec.md` §5), so `TemplateCache`
//! is a single-process, not-`Send` cache: many renders on the same thread
//! (or coordinated via a single-threaded executor) share it, rather than
//! many OS threads. A host that needs true cross-thread sharing would swap
//! `Rc` for `Arc` through the whole bytecode/value layer, which is out of
//! scope here (`DESIGN.md`).

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::Configuration;
use crate::dictionary::Dictionary;
use crate::error::ErrorLog;
use crate::parser::{Parser, SourceLoader};
use crate::processor::IncludeLoader;
use crate::program::Program;

/// Default per-cache capacity; zero in config is replaced by this
/// (`spec.md` §4.7 "Capacity: default 50 per cache; zero in config is
/// replaced by default").
pub const DEFAULT_CAPACITY: usize = 50;

/// Host-supplied filesystem seam (`spec.md` §6 "the OS file loader" is an
/// out-of-scope collaborator — this is the trait hosts plug into).
pub trait FileSource {
    fn read(&self, path: &str) -> std::io::Result<String>;
    /// Last-modified time and byte size, used for `watchfiles` staleness
    /// checks (`spec.md` §4.7 step 2).
    fn stat(&self, path: &str) -> std::io::Result<(SystemTime, u64)>;
}

/// `FileSource` backed directly by `std::fs`, the concrete default hosts
/// reach for (same "contract plus a ready-made concrete sink" texture as
/// [`crate::writer::StringWriter`]/`FileWriter`).
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSource;

impl FileSource for FsSource {
    fn read(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn stat(&self, path: &str) -> std::io::Result<(SystemTime, u64)> {
        let meta = std::fs::metadata(path)?;
        Ok((meta.modified()?, meta.len()))
    }
}

/// Compile-time parse errors never fail a build (`parser::Parser` recovers
/// and keeps going); only a missing/unreadable source file does.
#[derive(Debug)]
pub enum CacheError {
    Io(String, std::io::Error),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Io(path, e) => write!(f, "reading '{path}': {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

type DepStamp = (String, SystemTime, u64);

struct ProgramEntry {
    program: Rc<Program>,
    errors: Rc<ErrorLog>,
    deps: Vec<DepStamp>,
    last_used: AtomicU64,
}

struct DictEntry {
    dict: Rc<Dictionary>,
    deps: Vec<DepStamp>,
    last_used: AtomicU64,
}

struct ConfigEntry {
    config: Rc<Configuration>,
    deps: Vec<DepStamp>,
    last_used: AtomicU64,
}

/// Assembles compiled `Program`s/`Dictionary`s/`Configuration`s from source
/// files, sharing one instance across many `generate` calls.
pub struct TemplateCache<F: FileSource> {
    source: F,
    capacity: usize,
    shorttag: bool,
    watchfiles: bool,
    programs: DashMap<String, ProgramEntry>,
    dicts: DashMap<String, DictEntry>,
    configs: DashMap<String, ConfigEntry>,
    /// Per-key build locks (`spec.md` §5 "Writes ... serialize per key").
    /// `Arc`, not `Rc`: the lock guards are the only piece of cache state
    /// genuinely safe to share across threads, since they hold no `Program`.
    build_locks: DashMap<String, Arc<Mutex<()>>>,
    tick: AtomicU64,
}

impl<F: FileSource> TemplateCache<F> {
    pub fn new(source: F, capacity: usize, shorttag: bool, watchfiles: bool) -> Self {
        TemplateCache {
            source,
            capacity: if capacity == 0 { DEFAULT_CAPACITY } else { capacity },
            shorttag,
            watchfiles,
            programs: DashMap::new(),
            dicts: DashMap::new(),
            configs: DashMap::new(),
            build_locks: DashMap::new(),
            tick: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn build_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.build_locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn stamp(&self, path: &str) -> Option<DepStamp> {
        self.source.stat(path).ok().map(|(mtime, size)| (path.to_string(), mtime, size))
    }

    fn is_stale(&self, deps: &[DepStamp]) -> bool {
        if !self.watchfiles {
            return false;
        }
        deps.iter().any(|(path, mtime, size)| match self.source.stat(path) {
            Ok((m, s)) => m != *mtime || s != *size,
            // A dependency that can no longer be stat'd counts as changed;
            // a transient race here just triggers one extra rebuild
            // (`spec.md` §5: "a race that returns a just-stale Program is
            // tolerated").
            Err(_) => true,
        })
    }

    /// Resolve `path` to its compiled `Program`, rebuilding under the
    /// per-key build lock if absent or stale (`spec.md` §4.7 steps 2-4).
    pub fn get_program(&self, path: &str) -> Result<Rc<Program>, CacheError> {
        if let Some(entry) = self.programs.get(path) {
            if !self.is_stale(&entry.deps) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(entry.program.clone());
            }
        }
        let lock = self.build_lock(path);
        let _guard = lock.lock();
        if let Some(entry) = self.programs.get(path) {
            if !self.is_stale(&entry.deps) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(entry.program.clone());
            }
        }
        let text = self.source.read(path).map_err(|e| CacheError::Io(path.to_string(), e))?;
        let result = Parser::new(text, path, Some(self as &dyn SourceLoader), self.shorttag).compile();
        let deps: Vec<DepStamp> = result.program.files.iter().filter_map(|f| self.stamp(f)).collect();
        let entry = ProgramEntry {
            program: Rc::new(result.program),
            errors: Rc::new(result.errors),
            deps,
            last_used: AtomicU64::new(self.tick()),
        };
        let program = entry.program.clone();
        self.insert_program(path.to_string(), entry);
        Ok(program)
    }

    /// Compile-time diagnostics attached to the last build of `path`, if it
    /// has been compiled at all (`spec.md`/`SPEC_FULL.md` §2 "`TemplateCache`
    /// can attach compile-time errors to a cached `Program`").
    pub fn program_errors(&self, path: &str) -> Option<Rc<ErrorLog>> {
        self.programs.get(path).map(|e| e.errors.clone())
    }

    pub fn get_dict(&self, path: &str) -> Result<Rc<Dictionary>, CacheError> {
        if let Some(entry) = self.dicts.get(path) {
            if !self.is_stale(&entry.deps) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(entry.dict.clone());
            }
        }
        let lock = self.build_lock(path);
        let _guard = lock.lock();
        if let Some(entry) = self.dicts.get(path) {
            if !self.is_stale(&entry.deps) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(entry.dict.clone());
            }
        }
        let text = self.source.read(path).map_err(|e| CacheError::Io(path.to_string(), e))?;
        let mut warnings = Vec::new();
        let dict = Dictionary::parse(&text, &mut warnings);
        let deps: Vec<DepStamp> = self.stamp(path).into_iter().collect();
        let entry = DictEntry { dict: Rc::new(dict), deps, last_used: AtomicU64::new(self.tick()) };
        let dict = entry.dict.clone();
        self.insert_dict(path.to_string(), entry);
        Ok(dict)
    }

    pub fn get_config(&self, path: &str) -> Result<Rc<Configuration>, CacheError> {
        if let Some(entry) = self.configs.get(path) {
            if !self.is_stale(&entry.deps) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(entry.config.clone());
            }
        }
        let lock = self.build_lock(path);
        let _guard = lock.lock();
        if let Some(entry) = self.configs.get(path) {
            if !self.is_stale(&entry.deps) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(entry.config.clone());
            }
        }
        let text = self.source.read(path).map_err(|e| CacheError::Io(path.to_string(), e))?;
        let mut warnings = Vec::new();
        let config = Configuration::parse(&text, &mut warnings);
        let deps: Vec<DepStamp> = self.stamp(path).into_iter().collect();
        let entry = ConfigEntry { config: Rc::new(config), deps, last_used: AtomicU64::new(self.tick()) };
        let config = entry.config.clone();
        self.insert_config(path.to_string(), entry);
        Ok(config)
    }

    fn insert_program(&self, key: String, entry: ProgramEntry) {
        self.programs.insert(key, entry);
        if self.programs.len() > self.capacity {
            if let Some(lru) = self.programs.iter().min_by_key(|e| e.value().last_used.load(Ordering::Relaxed)).map(|e| e.key().clone()) {
                self.programs.remove(&lru);
            }
        }
    }

    fn insert_dict(&self, key: String, entry: DictEntry) {
        self.dicts.insert(key, entry);
        if self.dicts.len() > self.capacity {
            if let Some(lru) = self.dicts.iter().min_by_key(|e| e.value().last_used.load(Ordering::Relaxed)).map(|e| e.key().clone()) {
                self.dicts.remove(&lru);
            }
        }
    }

    fn insert_config(&self, key: String, entry: ConfigEntry) {
        self.configs.insert(key, entry);
        if self.configs.len() > self.capacity {
            if let Some(lru) = self.configs.iter().min_by_key(|e| e.value().last_used.load(Ordering::Relaxed)).map(|e| e.key().clone()) {
                self.configs.remove(&lru);
            }
        }
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }
}

/// Compile-time loader seam for `extends`: reads a base template's raw
/// source straight from the backing `FileSource`, bypassing the program
/// cache (the base's own compiled form is never cached standalone — it
/// only exists spliced into whichever extending program pulled it in).
impl<F: FileSource> SourceLoader for TemplateCache<F> {
    fn load(&self, path: &str) -> Option<String> {
        self.source.read(path).ok()
    }
}

/// Runtime loader seam for `include`: resolves through the same cache and
/// invalidation policy as a top-level template.
impl<F: FileSource> IncludeLoader for TemplateCache<F> {
    fn load(&self, path: &str) -> Option<Rc<Program>> {
        self.get_program(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// In-memory `FileSource` for tests: a fixed map of path -> (text, mtime,
    /// size), with `touch` to simulate an edit bumping mtime.
    struct MapSource {
        files: RefCell<HashMap<String, (String, SystemTime, u64)>>,
    }

    impl MapSource {
        fn new() -> Self {
            MapSource { files: RefCell::new(HashMap::new()) }
        }

        fn put(&self, path: &str, text: &str, mtime: SystemTime) {
            self.files.borrow_mut().insert(path.to_string(), (text.to_string(), mtime, text.len() as u64));
        }
    }

    impl FileSource for MapSource {
        fn read(&self, path: &str) -> std::io::Result<String> {
            self.files
                .borrow()
                .get(path)
                .map(|(text, _, _)| text.clone())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
        }

        fn stat(&self, path: &str) -> std::io::Result<(SystemTime, u64)> {
            self.files
                .borrow()
                .get(path)
                .map(|(_, mtime, size)| (*mtime, *size))
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
        }
    }

    fn epoch(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs)
    }

    #[test]
    fn compiles_and_reuses_cached_program() {
        let src = MapSource::new();
        src.put("a.teng", "hello", epoch(1));
        let cache = TemplateCache::new(src, 10, true, true);
        let p1 = cache.get_program("a.teng").unwrap();
        let p2 = cache.get_program("a.teng").unwrap();
        assert!(Rc::ptr_eq(&p1, &p2));
        assert_eq!(cache.program_count(), 1);
    }

    #[test]
    fn watchfiles_rebuilds_on_mtime_change() {
        let src = MapSource::new();
        src.put("a.teng", "one", epoch(1));
        let cache = TemplateCache::new(src, 10, true, true);
        let p1 = cache.get_program("a.teng").unwrap();
        cache.source.put("a.teng", "two!", epoch(2));
        let p2 = cache.get_program("a.teng").unwrap();
        assert!(!Rc::ptr_eq(&p1, &p2));
    }

    #[test]
    fn watchfiles_off_never_rebuilds() {
        let src = MapSource::new();
        src.put("a.teng", "one", epoch(1));
        let cache = TemplateCache::new(src, 10, true, false);
        let p1 = cache.get_program("a.teng").unwrap();
        cache.source.put("a.teng", "two!", epoch(2));
        let p2 = cache.get_program("a.teng").unwrap();
        assert!(Rc::ptr_eq(&p1, &p2));
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let src = MapSource::new();
        for i in 0..4 {
            src.put(&format!("t{i}.teng"), "x", epoch(i as u64));
        }
        let cache = TemplateCache::new(src, 3, true, true);
        for i in 0..3 {
            cache.get_program(&format!("t{i}.teng")).unwrap();
        }
        // touch t0 and t1 so t2 is the least recently used
        cache.get_program("t0.teng").unwrap();
        cache.get_program("t1.teng").unwrap();
        cache.get_program("t3.teng").unwrap();
        assert_eq!(cache.program_count(), 3);
        assert!(cache.programs.get("t2.teng").is_none());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let src = MapSource::new();
        let cache = TemplateCache::new(src, 10, true, true);
        match cache.get_program("missing.teng") {
            Err(CacheError::Io(path, _)) => assert_eq!(path, "missing.teng"),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn dict_cache_parses_and_reuses() {
        let src = MapSource::new();
        src.put("d.dict", "greeting hi\n", epoch(1));
        let cache = TemplateCache::new(src, 10, true, true);
        let d1 = cache.get_dict("d.dict").unwrap();
        assert_eq!(d1.lookup("greeting"), Some("hi"));
        let d2 = cache.get_dict("d.dict").unwrap();
        assert!(Rc::ptr_eq(&d1, &d2));
    }
}
