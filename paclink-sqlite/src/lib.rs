//! # Paclink SQLite
//!
//! Atomic snapshots of the routing state: neighbors, routes, link
//! statistics, the high-water packet id, and per-origin NODES broadcast
//! intervals. One snapshot replaces the previous one in a single
//! transaction; loading validates age and configuration hash before
//! anything is handed back.

pub mod schema;

use paclink_proto::address::Address;
use paclink_route::{LinkStat, Neighbor, NeighborSource, Route, RouteSource};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Ignore NODES broadcasts closer together than this when estimating an
/// origin's interval; they are duplicates of one transmission.
const ORIGIN_DUPLICATE_WINDOW_MS: i64 = 10_000;
/// EWMA weight for origin broadcast intervals.
const ORIGIN_INTERVAL_ALPHA: f64 = 0.3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A complete persisted state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub neighbors: Vec<Neighbor>,
    pub routes: Vec<Route>,
    pub link_stats: Vec<LinkStat>,
    /// High-water mark: the id of the last packet folded into this state.
    pub last_packet_id: i64,
    pub config_hash: Option<String>,
    pub snapshot_timestamp_ms: i64,
}

/// Load-time validity and sanitization parameters.
#[derive(Debug, Clone)]
pub struct LoadParams {
    pub now_ms: i64,
    /// Snapshots older than this are rejected outright.
    pub max_snapshot_age_ms: i64,
    /// When set, a stored hash that differs rejects the snapshot.
    pub expected_config_hash: Option<String>,
    /// Entries older than this keep their row but load with quality 0.
    pub entry_ttl_ms: i64,
    /// Replacement horizon for implausible timestamps.
    pub sliding_window_ms: i64,
}

/// The snapshot store.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.migrate()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.migrate()?;
        Ok(storage)
    }

    /// Wraps an existing connection (tests, migrations from older files).
    pub fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(schema::CREATE_TABLES)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.migrate()?;
        Ok(storage)
    }

    /// Schema migration: older files lack `obs_count`; add it with default
    /// 1 so preexisting evidence is not read as zero observations.
    fn migrate(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut has_obs_count = false;
        {
            let mut stmt = conn.prepare("PRAGMA table_info(link_stats)")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                if name == "obs_count" {
                    has_obs_count = true;
                }
            }
        }
        if !has_obs_count {
            debug!("migrating link_stats: adding obs_count");
            conn.execute_batch(
                "ALTER TABLE link_stats ADD COLUMN obs_count INTEGER NOT NULL DEFAULT 1;",
            )?;
        }
        Ok(())
    }

    /// Writes one snapshot atomically, fully replacing the previous state.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM neighbors", [])?;
        tx.execute("DELETE FROM routes", [])?;
        tx.execute("DELETE FROM link_stats", [])?;
        tx.execute("DELETE FROM meta", [])?;

        for n in &snapshot.neighbors {
            tx.execute(
                "INSERT OR REPLACE INTO neighbors
                 (call, quality, last_seen, obsolescence_count, source_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    n.callsign.to_string(),
                    n.quality,
                    n.last_seen_ms,
                    n.obsolescence_count,
                    neighbor_source_str(n.source),
                ],
            )?;
        }
        for r in &snapshot.routes {
            tx.execute(
                "INSERT OR REPLACE INTO routes
                 (destination, origin, quality, path, source_type, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    r.destination.to_string(),
                    r.origin.to_string(),
                    r.quality,
                    encode_path(&r.path),
                    route_source_str(r.source),
                    r.last_updated_ms,
                ],
            )?;
        }
        for s in &snapshot.link_stats {
            tx.execute(
                "INSERT OR REPLACE INTO link_stats
                 (from_call, to_call, quality, last_updated, df_estimate, dr_estimate,
                  dup_count, ewma_quality, obs_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    s.from.to_string(),
                    s.to.to_string(),
                    s.quality,
                    s.last_updated_ms,
                    s.df_estimate,
                    s.dr_estimate,
                    s.duplicate_count as i64,
                    s.ewma_quality,
                    s.observation_count as i64,
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO meta (id, last_packet_id, config_hash, snapshot_timestamp)
             VALUES (1, ?1, ?2, ?3)",
            params![
                snapshot.last_packet_id,
                snapshot.config_hash,
                snapshot.snapshot_timestamp_ms,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Loads the stored snapshot if it is fresh enough and belongs to the
    /// expected configuration. Expired entries are kept (for display) with
    /// quality decayed to zero; implausible timestamps are normalized.
    pub fn load_snapshot(&self, load: &LoadParams) -> StorageResult<Option<Snapshot>> {
        let conn = self.conn.lock().unwrap();

        let meta: Option<(i64, Option<String>, i64)> = conn
            .query_row(
                "SELECT last_packet_id, config_hash, snapshot_timestamp FROM meta WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((last_packet_id, config_hash, snapshot_timestamp_ms)) = meta else {
            return Ok(None);
        };

        if load.now_ms - snapshot_timestamp_ms > load.max_snapshot_age_ms {
            debug!("snapshot rejected: stale");
            return Ok(None);
        }
        if let Some(expected) = &load.expected_config_hash {
            if config_hash.as_deref() != Some(expected.as_str()) {
                debug!("snapshot rejected: config hash mismatch");
                return Ok(None);
            }
        }

        let mut neighbors = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT call, quality, last_seen, obsolescence_count, source_type
                 FROM neighbors ORDER BY quality DESC, call ASC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let call: String = row.get(0)?;
                let Ok(callsign) = call.parse::<Address>() else {
                    warn!(%call, "skipping neighbor with unparseable callsign");
                    continue;
                };
                let last_seen_ms = sanitize_timestamp(row.get(2)?, load);
                let mut quality: u8 = clamp_quality(row.get::<_, i64>(1)?);
                if load.now_ms - last_seen_ms > load.entry_ttl_ms {
                    quality = 0;
                }
                neighbors.push(Neighbor {
                    callsign,
                    quality,
                    last_seen_ms,
                    obsolescence_count: row.get(3)?,
                    source: neighbor_source_from(&row.get::<_, String>(4)?),
                });
            }
        }

        let mut routes = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT destination, origin, quality, path, source_type, last_updated
                 FROM routes ORDER BY destination ASC, quality DESC, origin ASC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let dest: String = row.get(0)?;
                let origin: String = row.get(1)?;
                let (Ok(destination), Ok(origin)) =
                    (dest.parse::<Address>(), origin.parse::<Address>())
                else {
                    warn!(%dest, "skipping route with unparseable endpoint");
                    continue;
                };
                let last_updated_ms = sanitize_timestamp(row.get(5)?, load);
                let mut quality: u8 = clamp_quality(row.get::<_, i64>(2)?);
                if load.now_ms - last_updated_ms > load.entry_ttl_ms {
                    quality = 0;
                }
                routes.push(Route {
                    destination,
                    origin,
                    quality,
                    path: decode_path(&row.get::<_, String>(3)?),
                    last_updated_ms,
                    source: route_source_from(&row.get::<_, String>(4)?),
                });
            }
        }

        let mut link_stats = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT from_call, to_call, quality, last_updated, df_estimate, dr_estimate,
                        dup_count, ewma_quality, obs_count
                 FROM link_stats ORDER BY from_call ASC, to_call ASC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let from: String = row.get(0)?;
                let to: String = row.get(1)?;
                let (Ok(from), Ok(to)) = (from.parse::<Address>(), to.parse::<Address>()) else {
                    warn!("skipping link stat with unparseable callsign");
                    continue;
                };
                link_stats.push(LinkStat {
                    from,
                    to,
                    quality: clamp_quality(row.get::<_, i64>(2)?),
                    last_updated_ms: sanitize_timestamp(row.get(3)?, load),
                    df_estimate: row.get(4)?,
                    dr_estimate: row.get(5)?,
                    duplicate_count: row.get::<_, i64>(6)?.max(0) as u64,
                    ewma_quality: clamp_quality(row.get::<_, i64>(7)?),
                    observation_count: row.get::<_, i64>(8)?.max(0) as u64,
                });
            }
        }

        Ok(Some(Snapshot {
            neighbors,
            routes,
            link_stats,
            last_packet_id,
            config_hash,
            snapshot_timestamp_ms,
        }))
    }

    /// Records one NODES broadcast arrival for an origin and updates its
    /// estimated interval. Arrivals within the duplicate window of the
    /// previous one are ignored.
    pub fn record_origin_broadcast(&self, origin: &Address, now_ms: i64) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let call = origin.to_string();

        let existing: Option<(f64, i64, i64)> = conn
            .query_row(
                "SELECT estimated_interval_seconds, last_broadcast, broadcast_count
                 FROM origin_intervals WHERE origin = ?1",
                params![call],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO origin_intervals
                     (origin, estimated_interval_seconds, last_broadcast, broadcast_count)
                     VALUES (?1, 0, ?2, 1)",
                    params![call, now_ms],
                )?;
            }
            Some((interval, last, count)) => {
                let gap_ms = now_ms - last;
                if gap_ms < ORIGIN_DUPLICATE_WINDOW_MS {
                    return Ok(());
                }
                let gap_secs = gap_ms as f64 / 1000.0;
                let updated = if interval <= 0.0 {
                    gap_secs
                } else {
                    ORIGIN_INTERVAL_ALPHA * gap_secs + (1.0 - ORIGIN_INTERVAL_ALPHA) * interval
                };
                conn.execute(
                    "UPDATE origin_intervals
                     SET estimated_interval_seconds = ?2, last_broadcast = ?3,
                         broadcast_count = ?4
                     WHERE origin = ?1",
                    params![call, updated, now_ms, count + 1],
                )?;
            }
        }
        Ok(())
    }

    /// Estimated broadcast interval for an origin, seconds.
    pub fn origin_interval(&self, origin: &Address) -> StorageResult<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT estimated_interval_seconds FROM origin_intervals WHERE origin = ?1",
                params![origin.to_string()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Deletes entries untouched for `retention_days`. Returns
    /// (neighbors, routes, link stats) deleted.
    pub fn prune_old_entries(
        &self,
        retention_days: i64,
        now_ms: i64,
    ) -> StorageResult<(usize, usize, usize)> {
        let cutoff = now_ms - retention_days * 86_400_000;
        let conn = self.conn.lock().unwrap();
        let neighbors = conn.execute("DELETE FROM neighbors WHERE last_seen < ?1", params![cutoff])?;
        let routes = conn.execute("DELETE FROM routes WHERE last_updated < ?1", params![cutoff])?;
        let links =
            conn.execute("DELETE FROM link_stats WHERE last_updated < ?1", params![cutoff])?;
        Ok((neighbors, routes, links))
    }
}

/// Invalid stored timestamps (zero, negative, or distant-past sentinels)
/// are replaced with a plausible recent instant; valid history is kept.
fn sanitize_timestamp(stored_ms: i64, load: &LoadParams) -> i64 {
    if stored_ms <= 0 {
        load.now_ms - load.sliding_window_ms
    } else {
        stored_ms
    }
}

fn clamp_quality(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

fn encode_path(path: &[Address]) -> String {
    path.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_path(raw: &str) -> Vec<Address> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn neighbor_source_str(source: NeighborSource) -> &'static str {
    match source {
        NeighborSource::Classic => "classic",
        NeighborSource::Inferred => "inferred",
    }
}

fn neighbor_source_from(raw: &str) -> NeighborSource {
    match raw {
        "inferred" => NeighborSource::Inferred,
        _ => NeighborSource::Classic,
    }
}

fn route_source_str(source: RouteSource) -> &'static str {
    match source {
        RouteSource::Broadcast => "broadcast",
        RouteSource::Classic => "classic",
        RouteSource::Inferred => "inferred",
    }
}

fn route_source_from(raw: &str) -> RouteSource {
    match raw {
        "classic" => RouteSource::Classic,
        "inferred" => RouteSource::Inferred,
        _ => RouteSource::Broadcast,
    }
}
