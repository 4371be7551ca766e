use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 6790;
pub const DEFAULT_LOG_FILE: &str = "/data/local/tmp/uia-server.log";
pub const DEFAULT_LOG_FILTER: &str = "debug";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub log_file: PathBuf,
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies the port the instrumentation was started with. Values outside
    /// the TCP port range (the launcher passes 0 when none was given) keep the
    /// configured port.
    pub fn with_launch_port(mut self, port: i32) -> Self {
        if let Ok(port @ 1..) = u16::try_from(port) {
            self.port = port;
        }
        self
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: lookup("UIA_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            log_file: lookup("UIA_LOG_FILE")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
            log_filter: lookup("UIA_LOG")
                .filter(|f| !f.is_empty())
                .unwrap_or(defaults.log_filter),
        }
    }
}
