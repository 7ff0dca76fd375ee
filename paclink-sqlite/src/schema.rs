pub const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS neighbors (
        call TEXT PRIMARY KEY,
        quality INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        obsolescence_count INTEGER NOT NULL DEFAULT 0,
        source_type TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS routes (
        destination TEXT NOT NULL,
        origin TEXT NOT NULL,
        quality INTEGER NOT NULL,
        path TEXT NOT NULL,
        source_type TEXT NOT NULL,
        last_updated INTEGER NOT NULL,
        PRIMARY KEY (destination, origin)
    );

    CREATE TABLE IF NOT EXISTS link_stats (
        from_call TEXT NOT NULL,
        to_call TEXT NOT NULL,
        quality INTEGER NOT NULL,
        last_updated INTEGER NOT NULL,
        df_estimate REAL,
        dr_estimate REAL,
        dup_count INTEGER NOT NULL DEFAULT 0,
        ewma_quality INTEGER NOT NULL DEFAULT 0,
        obs_count INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (from_call, to_call)
    );

    CREATE TABLE IF NOT EXISTS meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_packet_id INTEGER NOT NULL DEFAULT 0,
        config_hash TEXT,
        snapshot_timestamp INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS origin_intervals (
        origin TEXT PRIMARY KEY,
        estimated_interval_seconds REAL NOT NULL DEFAULT 0,
        last_broadcast INTEGER NOT NULL,
        broadcast_count INTEGER NOT NULL DEFAULT 1
    );
";
