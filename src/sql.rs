//! SQL classification used to route statements.
//!
//! Only what routing needs is recognized: whether a statement is a plain
//! read, whether it takes row locks, and which sequences it advances.

use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

lazy_static::lazy_static! {
    static ref SELECT: Regex = Regex::new(r"(?is)^\s*(?:\(\s*)*select\b").unwrap();
    static ref FOR_UPDATE: Regex = Regex::new(r"(?is)\bfor\s+update\b").unwrap();
    static ref NEXTVAL: Regex = Regex::new(r#"(?i)\bnextval\s*\(\s*'([\w.$"]+)'\s*\)"#).unwrap();
    static ref NEXT_VALUE_FOR: Regex = Regex::new(r#"(?i)\bnext\s+value\s+for\s+([\w.$"]+)"#).unwrap();
}

/// Routing-relevant facts about one SQL string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlTraits {
    pub select: bool,
    pub select_for_update: bool,
    /// Sequences advanced by the statement, lower-cased and deduplicated
    pub sequences: Vec<String>,
}

impl SqlTraits {
    /// True when the statement can be served by a single replica
    pub fn is_read_only(&self) -> bool {
        self.select && !self.select_for_update && self.sequences.is_empty()
    }

    /// Names of the locks a broadcast of this statement must hold
    pub fn lock_names(&self) -> Vec<String> {
        self.sequences
            .iter()
            .map(|sequence| format!("sequence:{}", sequence))
            .collect()
    }
}

/// Classifies statements, caching results per SQL string.
pub struct SqlClassifier {
    detect_sequences: bool,
    cache: Mutex<LruCache<String, Arc<SqlTraits>>>,
}

impl SqlClassifier {
    pub fn new(capacity: usize, detect_sequences: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            detect_sequences,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn classify(&self, sql: &str) -> Arc<SqlTraits> {
        let key = sql.to_string();
        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(traits) = cache.get(&key) {
                return Arc::clone(traits);
            }
        }

        let traits = Arc::new(self.analyze(sql));

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.put(key, Arc::clone(&traits));
        traits
    }

    /// Number of cached classifications
    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn analyze(&self, sql: &str) -> SqlTraits {
        let select = SELECT.is_match(sql);
        let select_for_update = select && FOR_UPDATE.is_match(sql);

        let mut sequences = Vec::new();
        if self.detect_sequences {
            for pattern in [&*NEXTVAL, &*NEXT_VALUE_FOR] {
                for captures in pattern.captures_iter(sql) {
                    let name = captures[1].trim_matches('"').to_lowercase();
                    if !sequences.contains(&name) {
                        sequences.push(name);
                    }
                }
            }
        }

        SqlTraits {
            select,
            select_for_update,
            sequences,
        }
    }
}

impl std::fmt::Debug for SqlClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlClassifier")
            .field("detect_sequences", &self.detect_sequences)
            .field("cached", &self.cached())
            .finish()
    }
}
