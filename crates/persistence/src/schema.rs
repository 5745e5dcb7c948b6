//! Database schema definitions

/// SQL to create all tables
/// NOTE: coefficient vectors are stored as JSON arrays in TEXT columns;
/// CHECK and UNIQUE constraints back up the validation done in Rust
pub const CREATE_TABLES: &str = r#"
-- Canonical DEX pools
CREATE TABLE IF NOT EXISTS pools (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chain TEXT NOT NULL,
    dex TEXT NOT NULL,
    pool_address TEXT NOT NULL,
    token_a_symbol TEXT NOT NULL,
    token_b_symbol TEXT NOT NULL,
    token_a_address TEXT NOT NULL,
    token_b_address TEXT NOT NULL,
    pair_label TEXT NOT NULL,
    fee_tier_bps INTEGER NOT NULL CHECK (fee_tier_bps > 0),
    in_main_sample INTEGER NOT NULL DEFAULT 1,
    sample_start TEXT,
    sample_end TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (chain, pair_label, fee_tier_bps),
    CHECK (sample_start IS NULL OR sample_end IS NULL OR sample_start < sample_end)
);

-- ACD(p,q) estimation runs (immutable)
CREATE TABLE IF NOT EXISTS model_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pool_id INTEGER NOT NULL REFERENCES pools(id),
    p INTEGER NOT NULL CHECK (p >= 0),
    q INTEGER NOT NULL CHECK (q >= 0),
    innovation TEXT NOT NULL CHECK (innovation IN ('exponential', 'weibull', 'generalized_gamma')),
    weibull_shape REAL,
    gengamma_kappa REAL,
    gengamma_nu REAL,
    duration_unit TEXT NOT NULL,
    diurnal_adjusted INTEGER NOT NULL DEFAULT 0,
    sample_size INTEGER NOT NULL CHECK (sample_size > 0),
    intercept REAL NOT NULL,
    duration_coefs TEXT NOT NULL,
    psi_coefs TEXT NOT NULL,
    stationarity_slack REAL NOT NULL CHECK (stationarity_slack > 0),
    psi_lags TEXT NOT NULL,
    theta_hat TEXT NOT NULL,
    log_likelihood REAL NOT NULL,
    optimizer_status TEXT NOT NULL,
    iterations INTEGER CHECK (iterations IS NULL OR iterations > 0),
    grad_norm REAL CHECK (grad_norm IS NULL OR grad_norm >= 0),
    estimation_start TEXT NOT NULL,
    estimation_end TEXT NOT NULL,
    created_at TEXT NOT NULL,
    -- lets observations reference (run, pool) together
    UNIQUE (id, pool_id),
    CHECK (p + q > 0),
    CHECK (estimation_start < estimation_end)
);

-- Daily (pool, date) observations, one live row per (pool, date)
CREATE TABLE IF NOT EXISTS metric_observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pool_id INTEGER NOT NULL REFERENCES pools(id),
    trading_date TEXT NOT NULL,
    v3_spread_bps REAL,
    v2_spread_bps REAL,
    spread_ratio REAL,
    pool_tvl_usd REAL,
    pool_volume_usd REAL,
    pool_swap_count REAL,
    pair_realized_vol REAL,
    pair_cex_volume_usd REAL,
    chain_gas_price_gwei REAL,
    chain_tx_count REAL,
    chain_block_time_secs REAL,
    acd_intensity REAL,
    model_run_id INTEGER,
    data_version INTEGER NOT NULL DEFAULT 1 CHECK (data_version >= 1),
    created_at TEXT NOT NULL,
    UNIQUE (pool_id, trading_date, data_version),
    FOREIGN KEY (model_run_id, pool_id) REFERENCES model_runs(id, pool_id)
);

-- ========== INDEXES ==========

CREATE UNIQUE INDEX IF NOT EXISTS idx_pools_address ON pools(lower(pool_address));
CREATE INDEX IF NOT EXISTS idx_runs_pool_start ON model_runs(pool_id, estimation_start);
CREATE INDEX IF NOT EXISTS idx_runs_pool_created ON model_runs(pool_id, created_at);
CREATE INDEX IF NOT EXISTS idx_metrics_date ON metric_observations(trading_date, pool_id)
"#;
