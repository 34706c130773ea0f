// Game rules text, loaded once at startup and injected verbatim into every
// prompt. Treated as an opaque external input.

use std::path::Path;

/// Read the rules file. A missing or unreadable file is logged and treated
/// as empty rather than failing startup.
pub fn load_rules(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            tracing::info!("Loaded rules text ({} bytes) from {}", text.len(), path.display());
            text
        }
        Err(e) => {
            tracing::error!("Failed to read rules file {}: {e}", path.display());
            String::new()
        }
    }
}
