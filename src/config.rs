// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Path to the rules text injected into every prompt.
    pub rules_path: PathBuf,
    /// Whether to run in local mode (no auth, no rate limiting).
    pub local_mode: bool,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:battle_command.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `RULES_PATH` - Path to the game rules text (default: `instructions/rules.txt`)
    /// - `BC_LOCAL_MODE` - Set to `true` to enable local mode
    ///
    /// CLI flags:
    /// - `--local` - Enable local mode (same as `BC_LOCAL_MODE=true`)
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:battle_command.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        let rules_path = std::env::var("RULES_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("instructions/rules.txt"));

        let local_mode = args.contains(&"--local".to_string())
            || std::env::var("BC_LOCAL_MODE")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false);

        Config {
            database_url,
            port,
            rules_path,
            local_mode,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

/// Global flag indicating local mode is active.
/// This is set once at startup and read by the auth extractor.
static LOCAL_MODE: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

/// Set the local mode flag (called once at startup).
pub fn set_local_mode(enabled: bool) {
    LOCAL_MODE.store(enabled, std::sync::atomic::Ordering::Relaxed);
}

/// Check if local mode is active.
pub fn is_local_mode() -> bool {
    LOCAL_MODE.load(std::sync::atomic::Ordering::Relaxed)
}

/// The user ID used for the auto-created local user.
pub const LOCAL_USER_ID: &str = "00000000-0000-0000-0000-000000000001";
pub const LOCAL_USERNAME: &str = "local";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_mode_flag() {
        set_local_mode(false);
        assert!(!is_local_mode());
        set_local_mode(true);
        assert!(is_local_mode());
        // Reset for other tests
        set_local_mode(false);
    }
}
