/// Process-wide settings read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_buffer_size: usize,
    pub audit_db_path: String,
    pub audit_retention_months: u32,
    pub audit_max_page: usize,
    pub optimizer_workers: usize,
    pub optimizer_max_combinations: usize,
    pub symbol: String,
    pub initial_capital: f64,
    pub data_csv: Option<String>,
    pub report_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_buffer_size: 1000,
            audit_db_path: "audit.db".to_string(),
            audit_retention_months: 24,
            audit_max_page: 1000,
            optimizer_workers: num_cpus::get().max(1),
            optimizer_max_combinations: 0,
            symbol: "SPY".to_string(),
            initial_capital: 100_000.0,
            data_csv: None,
            report_dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bus_buffer_size: env_or("BUS_BUFFER_SIZE", d.bus_buffer_size).max(1),
            audit_db_path: std::env::var("AUDIT_DB_PATH").unwrap_or(d.audit_db_path),
            audit_retention_months: env_or("AUDIT_RETENTION_MONTHS", d.audit_retention_months),
            audit_max_page: env_or("AUDIT_MAX_PAGE", d.audit_max_page).max(1),
            optimizer_workers: env_or("OPT_WORKERS", d.optimizer_workers).max(1),
            optimizer_max_combinations: env_or("OPT_MAX_COMBINATIONS", d.optimizer_max_combinations),
            symbol: std::env::var("BACKTEST_SYMBOL").unwrap_or(d.symbol),
            initial_capital: env_or("BACKTEST_CAPITAL", d.initial_capital),
            data_csv: std::env::var("DATA_CSV").ok().filter(|s| !s.is_empty()),
            report_dir: std::env::var("REPORT_DIR").ok().filter(|s| !s.is_empty()),
        }
    }
}

pub(crate) fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
