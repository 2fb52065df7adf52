use env_logger::Env;
use log::LevelFilter;
use std::fmt;

/// Installs the process-wide logger. `RUST_LOG` overrides the default `info` filter.
/// Calling it twice is harmless.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Logger for unit and integration tests: captured by the test harness, debug level.
pub fn init_for_tests() {
    let _ = env_logger::Builder::new()
        .is_test(true)
        .filter_level(LevelFilter::Debug)
        .try_init();
}

/// Formats a (service, instance) pair the way every log line in the crate prints it.
pub struct Sid(pub u16, pub u16);

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(0x{:04x}, 0x{:04x})", self.0, self.1)
    }
}

/// Hex dump used by the `packet-dump` feature.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}
