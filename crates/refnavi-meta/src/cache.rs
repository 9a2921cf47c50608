//! Persistent memo of resolution outcomes.
//!
//! **L1** – [`DashMap`] in-memory map (lock-free concurrent reads).
//! **L2** – Optional SQLite database on disk, one row per normalized-title
//! key, so partially populated caches survive process restarts.
//!
//! On [`get`](ResultCache::get): check L1 first; on miss, fall through to L2
//! and promote the result back into L1 on hit. On
//! [`insert`](ResultCache::insert): write-through to both tiers.
//!
//! The cache is a memo, not a freshness-tracked store: entries carry no TTL
//! and the first write for a key wins (`INSERT OR IGNORE`). `Unresolved` is
//! cached like any other outcome — repeating a lookup that already failed
//! everywhere would only duplicate provider load.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rusqlite::{Connection, OpenFlags, params};

use crate::ResolvedMetadata;

/// Open a SQLite connection with WAL mode and standard pragmas.
fn open_sqlite(path: &Path) -> Result<Connection, rusqlite::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS resolved_metadata (
             normalized_title TEXT PRIMARY KEY,
             resolved         INTEGER NOT NULL,
             title            TEXT,
             abstract         TEXT,
             doi              TEXT,
             year             INTEGER,
             authors          TEXT,
             citation_count   INTEGER,
             source           TEXT
         );",
    )?;
    Ok(conn)
}

fn insert_row(conn: &Connection, key: &str, value: &ResolvedMetadata) -> Result<(), rusqlite::Error> {
    match value {
        ResolvedMetadata::Found {
            title,
            abstract_text,
            year,
            authors,
            doi,
            citation_count,
            source,
        } => {
            conn.execute(
                "INSERT OR IGNORE INTO resolved_metadata
                     (normalized_title, resolved, title, abstract, doi, year, authors, citation_count, source)
                 VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    key,
                    title,
                    abstract_text,
                    doi,
                    year,
                    serde_json::to_string(authors).unwrap_or_default(),
                    *citation_count as i64,
                    source,
                ],
            )?;
        }
        ResolvedMetadata::Unresolved => {
            conn.execute(
                "INSERT OR IGNORE INTO resolved_metadata (normalized_title, resolved)
                 VALUES (?1, 0)",
                params![key],
            )?;
        }
    }
    Ok(())
}

fn read_row(conn: &Connection, key: &str) -> Option<ResolvedMetadata> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT resolved, title, abstract, doi, year, authors, citation_count, source
             FROM resolved_metadata
             WHERE normalized_title = ?1",
        )
        .ok()?;

    stmt.query_row(params![key], |row| {
        let resolved: i64 = row.get(0)?;
        if resolved == 0 {
            return Ok(ResolvedMetadata::Unresolved);
        }
        let authors_json: Option<String> = row.get(5)?;
        Ok(ResolvedMetadata::Found {
            title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            abstract_text: row.get(2)?,
            doi: row.get(3)?,
            year: row.get(4)?,
            authors: authors_json
                .and_then(|j| serde_json::from_str(&j).ok())
                .unwrap_or_default(),
            citation_count: row.get::<_, Option<i64>>(6)?.unwrap_or(0).max(0) as u64,
            source: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        })
    })
    .ok()
}

/// Thread-safe two-tier memo for resolution outcomes, keyed by normalized
/// title. Safe under concurrent access from the resolver's worker pool; the
/// single writer connection is serialized behind a [`Mutex`], which the L1
/// map absorbs for hot keys.
pub struct ResultCache {
    entries: DashMap<String, ResolvedMetadata>,
    store: Option<Mutex<Connection>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    /// Create an in-memory-only cache (no disk persistence).
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            store: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open a persistent cache backed by a SQLite database at `path`.
    ///
    /// The L1 map starts empty and is populated lazily as keys are accessed.
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = open_sqlite(path)
            .map_err(|e| format!("Failed to open cache database at {}: {}", path.display(), e))?;
        Ok(Self {
            entries: DashMap::new(),
            store: Some(Mutex::new(conn)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Look up the memoized outcome for a normalized-title key.
    pub fn get(&self, key: &str) -> Option<ResolvedMetadata> {
        if let Some(entry) = self.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(title = key, "cache L1 hit");
            return Some(entry.clone());
        }

        let from_disk = if let Some(store) = &self.store {
            store.lock().ok().and_then(|conn| read_row(&conn, key))
        } else {
            None
        };

        if let Some(value) = from_disk {
            tracing::trace!(title = key, "cache L2 hit, promoting to L1");
            self.entries.insert(key.to_string(), value.clone());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(title = key, "cache miss");
        None
    }

    /// Memoize an outcome. First write for a key wins in both tiers; the
    /// resolver never writes the same key twice within one run, so a lost
    /// race simply means another worker resolved the same title first.
    pub fn insert(&self, key: &str, value: &ResolvedMetadata) {
        tracing::trace!(title = key, found = value.is_found(), "cache insert");
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| value.clone());

        if let Some(store) = &self.store
            && let Ok(conn) = store.lock()
        {
            let _ = insert_row(&conn, key, value);
        }
    }

    /// Number of cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of entries currently in the L1 in-memory map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the L1 map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether this cache has a persistent SQLite backing store.
    pub fn has_persistence(&self) -> bool {
        self.store.is_some()
    }
}
