use paclink_sqlite::{LoadParams, Storage};
use rusqlite::Connection;

/// Opening a database written by an older schema (no `obs_count` column on
/// link_stats) must add the column with default 1, so preexisting rows are
/// not treated as having zero observations.
#[test]
fn test_old_schema_gains_obs_count_default_one() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "
        CREATE TABLE link_stats (
            from_call TEXT NOT NULL,
            to_call TEXT NOT NULL,
            quality INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            df_estimate REAL,
            dr_estimate REAL,
            dup_count INTEGER NOT NULL DEFAULT 0,
            ewma_quality INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (from_call, to_call)
        );
        INSERT INTO link_stats
            (from_call, to_call, quality, last_updated, df_estimate, dr_estimate,
             dup_count, ewma_quality)
        VALUES ('K1AAA', 'K0ME', 200, 1000000, 0.8, NULL, 2, 190);
        CREATE TABLE meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_packet_id INTEGER NOT NULL DEFAULT 0,
            config_hash TEXT,
            snapshot_timestamp INTEGER NOT NULL
        );
        INSERT INTO meta (id, last_packet_id, config_hash, snapshot_timestamp)
        VALUES (1, 7, NULL, 1000000);
        ",
    )
    .unwrap();

    let storage = Storage::from_connection(conn).unwrap();
    let loaded = storage
        .load_snapshot(&LoadParams {
            now_ms: 1_100_000,
            max_snapshot_age_ms: 3_600_000,
            expected_config_hash: None,
            entry_ttl_ms: 1_800_000,
            sliding_window_ms: 900_000,
        })
        .unwrap()
        .unwrap();

    assert_eq!(loaded.link_stats.len(), 1);
    assert_eq!(loaded.link_stats[0].observation_count, 1);
    assert_eq!(loaded.link_stats[0].duplicate_count, 2);
    assert_eq!(loaded.last_packet_id, 7);
}
