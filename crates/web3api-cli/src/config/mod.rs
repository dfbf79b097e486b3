//! Configuration loading and resolution.
//!
//! Each setting resolves as: explicit flag, then environment variable, then
//! default.

use std::path::PathBuf;

/// Gateway used when nothing else is configured.
pub const DEFAULT_GATEWAY: &str = "https://ipfs.io";

pub const GATEWAY_ENV: &str = "WEB3API_GATEWAY";
pub const STORE_ENV: &str = "WEB3API_STORE";
pub const NAMES_ENV: &str = "WEB3API_NAMES";

/// Where the CLI fetches packages and resolves names from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub gateway: String,
    /// Local package directory; takes precedence over the gateway.
    pub store: Option<PathBuf>,
    /// JSON file of `{ "domain.eth": "<address>" }` records.
    pub names: Option<PathBuf>,
}

impl Settings {
    /// Storage resolves as one setting: an explicit `--gateway` or `--store`
    /// beats both environment variables.
    pub fn resolve(gateway: Option<&str>, store: Option<&str>, names: Option<&str>) -> Self {
        let store = match (gateway, store) {
            (Some(_), None) => None,
            (_, store) => resolve_store(store),
        };
        Self {
            gateway: resolve_gateway(gateway),
            store,
            names: resolve_names(names),
        }
    }
}

/// Resolve the IPFS gateway URL.
pub fn resolve_gateway(explicit: Option<&str>) -> String {
    if let Some(url) = explicit {
        return url.to_string();
    }

    if let Ok(env_url) = std::env::var(GATEWAY_ENV) {
        if !env_url.is_empty() {
            return env_url;
        }
    }

    DEFAULT_GATEWAY.to_string()
}

/// Resolve the local package store directory, if any.
pub fn resolve_store(explicit: Option<&str>) -> Option<PathBuf> {
    resolve_path(explicit, STORE_ENV)
}

/// Resolve the naming records file, if any.
pub fn resolve_names(explicit: Option<&str>) -> Option<PathBuf> {
    resolve_path(explicit, NAMES_ENV)
}

fn resolve_path(explicit: Option<&str>, env: &str) -> Option<PathBuf> {
    explicit
        .map(PathBuf::from)
        .or_else(|| std::env::var(env).ok().filter(|v| !v.is_empty()).map(PathBuf::from))
}

/// Read an inline argument, or a file's contents when prefixed with `@`.
pub fn read_arg(value: &str) -> std::io::Result<String> {
    match value.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path),
        None => Ok(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_wins() {
        assert_eq!(resolve_gateway(Some("http://localhost:8080")), "http://localhost:8080");
        assert_eq!(resolve_store(Some("/tmp/pkgs")), Some(PathBuf::from("/tmp/pkgs")));
        assert_eq!(resolve_names(Some("names.json")), Some(PathBuf::from("names.json")));
    }

    #[test]
    fn test_explicit_gateway_beats_store_env() {
        std::env::set_var(STORE_ENV, "/tmp/env-store");

        let settings = Settings::resolve(Some("http://explicit:8080"), None, None);
        assert_eq!(settings.gateway, "http://explicit:8080");
        assert_eq!(settings.store, None);

        let settings = Settings::resolve(None, None, None);
        assert_eq!(settings.store, Some(PathBuf::from("/tmp/env-store")));

        let settings = Settings::resolve(None, Some("/tmp/flag-store"), None);
        assert_eq!(settings.store, Some(PathBuf::from("/tmp/flag-store")));

        std::env::remove_var(STORE_ENV);
    }

    #[test]
    fn test_read_arg_inline_and_file() {
        assert_eq!(read_arg("{ a }").unwrap(), "{ a }");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ balance }}").unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(read_arg(&arg).unwrap(), "{ balance }");

        assert!(read_arg("@/definitely/not/here.graphql").is_err());
    }
}
