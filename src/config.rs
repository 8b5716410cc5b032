#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_VIEWER_PORT: u16 = 8090;
pub const DEFAULT_OFFLINE_DB: &str = "offline.db";
pub const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:8080";

/// 1 MiB keeps time-to-first-byte low for the player while still amortizing
/// the per-request overhead of talking to the origin.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Upload CDNs that host the video binaries.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &["utfs.io", "ufs.sh", "uploadthing.com"];

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub host: String,
    pub port: u16,
    pub allowed_hosts: Vec<String>,
    pub chunk_size: u64,
    pub offline_db: PathBuf,
    pub upstream: String,
    pub viewer_port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub allowed_hosts: Option<Vec<String>>,
    pub chunk_size: Option<u64>,
    pub offline_db: Option<PathBuf>,
    pub upstream: Option<String>,
    pub viewer_port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("VIDSTREAM_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("VIDSTREAM_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let allowed_hosts = overrides
        .allowed_hosts
        .map(normalize_hosts)
        .filter(|hosts| !hosts.is_empty())
        .or_else(|| {
            lookup_value("STREAM_ALLOWED_HOSTS", file_vars, &env_lookup)
                .map(|value| parse_host_list(&value))
                .filter(|hosts| !hosts.is_empty())
        })
        .unwrap_or_else(default_allowed_hosts);
    let chunk_size = overrides
        .chunk_size
        .or_else(|| {
            lookup_value("STREAM_CHUNK_SIZE", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u64>().ok())
        })
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    let offline_db = overrides
        .offline_db
        .or_else(|| lookup_value("OFFLINE_DB_PATH", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OFFLINE_DB));
    let upstream = overrides
        .upstream
        .or_else(|| lookup_value("VIEWER_UPSTREAM", file_vars, &env_lookup))
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_UPSTREAM.to_string());
    let viewer_port = overrides
        .viewer_port
        .or_else(|| {
            lookup_value("VIEWER_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_VIEWER_PORT);

    RuntimeSettings {
        host,
        port,
        allowed_hosts,
        chunk_size,
        offline_db,
        upstream,
        viewer_port,
    }
}

pub fn default_allowed_hosts() -> Vec<String> {
    DEFAULT_ALLOWED_HOSTS
        .iter()
        .map(|host| (*host).to_string())
        .collect()
}

/// Splits a comma separated host list, lowercasing entries and dropping blanks.
pub fn parse_host_list(value: &str) -> Vec<String> {
    normalize_hosts(value.split(',').map(str::to_string).collect())
}

fn normalize_hosts(hosts: Vec<String>) -> Vec<String> {
    hosts
        .into_iter()
        .map(|host| host.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .collect()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None)
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let settings = settings_from("");
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.allowed_hosts, default_allowed_hosts());
        assert_eq!(settings.offline_db, PathBuf::from(DEFAULT_OFFLINE_DB));
        assert_eq!(settings.upstream, DEFAULT_UPSTREAM);
        assert_eq!(settings.viewer_port, DEFAULT_VIEWER_PORT);
    }

    #[test]
    fn reads_port_chunk_size_and_hosts() {
        let settings = settings_from(
            "VIDSTREAM_PORT=\"4242\"\nSTREAM_CHUNK_SIZE=65536\nSTREAM_ALLOWED_HOSTS=\"cdn.test, .Media.Example ,,\"\n",
        );
        assert_eq!(settings.port, 4242);
        assert_eq!(settings.chunk_size, 65536);
        assert_eq!(settings.allowed_hosts, vec!["cdn.test", "media.example"]);
    }

    #[test]
    fn zero_chunk_size_falls_back_to_default() {
        let settings = settings_from("STREAM_CHUNK_SIZE=0\n");
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn invalid_port_defaults() {
        let settings = settings_from("VIDSTREAM_PORT=\"nope\"\nVIEWER_PORT=-3\n");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.viewer_port, DEFAULT_VIEWER_PORT);
    }

    #[test]
    fn upstream_trailing_slash_is_trimmed() {
        let settings = settings_from("VIEWER_UPSTREAM=\"http://backend:9000/\"\n");
        assert_eq!(settings.upstream, "http://backend:9000");
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("VIDSTREAM_HOST=\"file-host\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            if key == "VIDSTREAM_HOST" {
                Some("0.0.0.0".to_string())
            } else {
                None
            }
        });
        assert_eq!(settings.host, "0.0.0.0");
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export VIDSTREAM_HOST="0.0.0.0"
            OFFLINE_DB_PATH='/var/lib/offline.db'
            VIDSTREAM_PORT =  9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("VIDSTREAM_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("OFFLINE_DB_PATH").unwrap(), "/var/lib/offline.db");
        assert_eq!(vars.get("VIDSTREAM_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("VIDSTREAM_HOST".to_string(), "file-host".to_string());
        vars.insert("VIDSTREAM_PORT".to_string(), "7000".to_string());
        vars.insert("STREAM_ALLOWED_HOSTS".to_string(), "file.cdn".to_string());

        let overrides = RuntimeOverrides {
            host: Some("override-host".into()),
            port: Some(9000),
            allowed_hosts: Some(vec!["Override.CDN".into()]),
            chunk_size: Some(4096),
            ..RuntimeOverrides::default()
        };

        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "VIDSTREAM_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        );

        assert_eq!(settings.host, "override-host");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.allowed_hosts, vec!["override.cdn"]);
        assert_eq!(settings.chunk_size, 4096);
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let settings = build_runtime_settings_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                allowed_hosts: Some(vec![" ".into()]),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.allowed_hosts, default_allowed_hosts());
    }
}
