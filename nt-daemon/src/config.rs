//! Load config from a TOML file and the environment.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use nt_core::{Value, DEFAULT_PORT, PROTO_REV_CURRENT};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerAddr {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Value written at startup unless the table already holds one.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedEntry {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub persistent: bool,
}

/// Daemon configuration. File: `--config <path>`, `$XDG_CONFIG_HOME/ntcore/config.toml`
/// (default ~/.config) or /etc/ntcore/config.toml. Env overrides: NT_MODE, NT_PORT, NT_IDENTITY,
/// NT_SERVER, NT_PERSIST_FILE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,
    /// Name sent to peers during the handshake.
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Server listen address; empty means all interfaces.
    #[serde(default)]
    pub listen_address: String,
    /// Server listen port (default 1735).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client targets, tried round-robin.
    #[serde(default)]
    pub servers: Vec<ServerAddr>,
    /// Client target tried before `servers`.
    #[serde(default)]
    pub server_override: Option<ServerAddr>,
    /// Server persistent entry file.
    #[serde(default)]
    pub persist_file: Option<PathBuf>,
    #[serde(default = "default_update_rate_ms")]
    pub update_rate_ms: u64,
    #[serde(default = "default_protocol_revision")]
    pub protocol_revision: u16,
    #[serde(default)]
    pub entries: Vec<SeedEntry>,
}

fn default_identity() -> String {
    "nt-daemon".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_update_rate_ms() -> u64 {
    100
}
fn default_protocol_revision() -> u16 {
    PROTO_REV_CURRENT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            identity: default_identity(),
            listen_address: String::new(),
            port: default_port(),
            servers: Vec::new(),
            server_override: None,
            persist_file: None,
            update_rate_ms: default_update_rate_ms(),
            protocol_revision: default_protocol_revision(),
            entries: Vec::new(),
        }
    }
}

/// Load config: defaults, then the config file (explicit path or first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths(|k| std::env::var_os(k))
            .into_iter()
            .find(|p| p.exists())
        {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    Ok(c)
}

/// Candidate files in search order.
fn config_paths(var: impl Fn(&str) -> Option<OsString>) -> Vec<PathBuf> {
    let user_dir = var("XDG_CONFIG_HOME")
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .or_else(|| var("HOME").map(|h| PathBuf::from(h).join(".config")));
    user_dir
        .map(|d| d.join("ntcore/config.toml"))
        .into_iter()
        .chain(std::iter::once(PathBuf::from("/etc/ntcore/config.toml")))
        .collect()
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

fn parse(s: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str::<Config>(s)?)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("NT_MODE") {
        c.mode = match s.to_ascii_lowercase().as_str() {
            "server" => Mode::Server,
            "client" => Mode::Client,
            other => bail!("NT_MODE must be server or client, not {:?}", other),
        };
    }
    if let Some(s) = var("NT_PORT") {
        c.port = s.parse().with_context(|| format!("NT_PORT {:?}", s))?;
    }
    if let Some(s) = var("NT_IDENTITY") {
        c.identity = s;
    }
    if let Some(s) = var("NT_SERVER") {
        c.servers = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(parse_server)
            .collect::<anyhow::Result<_>>()?;
    }
    if let Some(s) = var("NT_PERSIST_FILE") {
        c.persist_file = (!s.is_empty()).then(|| PathBuf::from(s));
    }
    Ok(())
}

/// `host` or `host:port`.
fn parse_server(s: &str) -> anyhow::Result<ServerAddr> {
    match s.rsplit_once(':') {
        Some((host, port)) => Ok(ServerAddr {
            host: host.to_string(),
            port: port.parse().with_context(|| format!("port in {:?}", s))?,
        }),
        None => Ok(ServerAddr {
            host: s.to_string(),
            port: DEFAULT_PORT,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.mode, Mode::Server);
        assert_eq!(c.port, 1735);
        assert_eq!(c.protocol_revision, 0x0300);
        assert!(c.entries.is_empty());
    }

    #[test]
    fn full_file() {
        let c = parse(
            r#"
            mode = "client"
            identity = "dash"
            servers = [{ host = "10.0.0.2" }, { host = "roborio.local", port = 1736 }]
            server_override = { host = "10.0.0.9" }
            update_rate_ms = 50

            [[entries]]
            name = "/speed"
            value = { double = 1.5 }
            persistent = true

            [[entries]]
            name = "/modes"
            value = { string_array = ["auto", "teleop"] }
            "#,
        )
        .unwrap();
        assert_eq!(c.mode, Mode::Client);
        assert_eq!(c.servers[0].port, 1735);
        assert_eq!(c.servers[1].port, 1736);
        assert_eq!(c.server_override.unwrap().host, "10.0.0.9");
        assert_eq!(c.update_rate_ms, 50);
        assert_eq!(c.entries[0].value, Value::Double(1.5));
        assert!(c.entries[0].persistent);
        assert_eq!(
            c.entries[1].value,
            Value::StringArray(vec!["auto".into(), "teleop".into()])
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("NT_MODE", "Client"),
                ("NT_PORT", "1800"),
                ("NT_SERVER", "a, b:99"),
                ("NT_PERSIST_FILE", "/tmp/nt.ini"),
            ]),
        )
        .unwrap();
        assert_eq!(c.mode, Mode::Client);
        assert_eq!(c.port, 1800);
        assert_eq!(
            c.servers,
            vec![
                ServerAddr { host: "a".into(), port: 1735 },
                ServerAddr { host: "b".into(), port: 99 },
            ]
        );
        assert_eq!(c.persist_file, Some(PathBuf::from("/tmp/nt.ini")));
    }

    #[test]
    fn bad_env_values_fail() {
        let mut c = Config::default();
        assert!(apply_env(&mut c, env(&[("NT_MODE", "peer")])).is_err());
        assert!(apply_env(&mut c, env(&[("NT_PORT", "x")])).is_err());
    }

    #[test]
    fn search_prefers_xdg_config_home() {
        let paths = config_paths(|k| match k {
            "XDG_CONFIG_HOME" => Some("/xdg".into()),
            "HOME" => Some("/home/nt".into()),
            _ => None,
        });
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/xdg/ntcore/config.toml"),
                PathBuf::from("/etc/ntcore/config.toml"),
            ]
        );
        let paths = config_paths(|k| (k == "HOME").then(|| "/home/nt".into()));
        assert_eq!(paths[0], PathBuf::from("/home/nt/.config/ntcore/config.toml"));
        assert_eq!(config_paths(|_| None).len(), 1);
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nt.toml");
        std::fs::write(&path, "identity = \"from-file\"\n").unwrap();
        let c = load_file(&path).unwrap();
        assert_eq!(c.identity, "from-file");
        assert!(load_file(&dir.path().join("missing.toml")).is_err());
    }
}
