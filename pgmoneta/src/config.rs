//! Configuration: `pgmoneta.toml`, parsed with `toml_edit` into a builder,
//! the way `pageserver::config` does it — walked field by field rather
//! than deserialized blindly, so unrecognised keys are a hard error at
//! startup (spec.md §7 `ConfigError`).

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;
use toml_edit::{Document, Item};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub follow: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: Utf8PathBuf,
    pub unix_socket_dir: Utf8PathBuf,
    pub admin_listen_addr: Option<String>,
    pub workers: usize,
    pub authentication_timeout: Duration,
    pub retention_interval: Duration,
    pub verification_interval: Duration,
    /// Path to the `username:password` credentials file (spec.md §6's
    /// `pgmoneta_users.conf`); `None` means no server-initiated
    /// connection can authenticate. See `credentials` module.
    pub users_path: Option<Utf8PathBuf>,
    pub servers: Vec<ServerConfig>,
}

#[derive(Default)]
struct ConfigBuilder {
    base_dir: Option<Utf8PathBuf>,
    unix_socket_dir: Option<Utf8PathBuf>,
    admin_listen_addr: Option<String>,
    workers: Option<usize>,
    authentication_timeout: Option<Duration>,
    retention_interval: Option<Duration>,
    verification_interval: Option<Duration>,
    users_path: Option<Utf8PathBuf>,
    servers: Vec<ServerConfig>,
}

impl ConfigBuilder {
    fn build(self) -> anyhow::Result<Config> {
        Ok(Config {
            base_dir: self.base_dir.context("missing required option 'base_dir'")?,
            unix_socket_dir: self
                .unix_socket_dir
                .context("missing required option 'unix_socket_dir'")?,
            admin_listen_addr: self.admin_listen_addr,
            workers: self.workers.unwrap_or(0),
            authentication_timeout: self
                .authentication_timeout
                .unwrap_or(Duration::from_secs(5)),
            retention_interval: self.retention_interval.unwrap_or(Duration::from_secs(3600)),
            verification_interval: self
                .verification_interval
                .unwrap_or(Duration::from_secs(86400)),
            users_path: self.users_path,
            servers: self.servers,
        })
    }
}

fn parse_toml_string(name: &str, item: &Item) -> anyhow::Result<String> {
    item.as_str()
        .map(str::to_string)
        .with_context(|| format!("configuration option '{name}' is not a string"))
}

fn parse_toml_u64(name: &str, item: &Item) -> anyhow::Result<u64> {
    let i = item
        .as_integer()
        .with_context(|| format!("configuration option '{name}' is not an integer"))?;
    if i < 0 {
        bail!("configuration option '{name}' cannot be negative");
    }
    Ok(i as u64)
}

fn parse_toml_duration_secs(name: &str, item: &Item) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(parse_toml_u64(name, item)?))
}

/// Parses a `[[server]]` array-of-tables entry.
fn parse_server(table: &toml_edit::Table) -> anyhow::Result<ServerConfig> {
    let mut name = None;
    let mut host = None;
    let mut port = None;
    let mut user = None;
    let mut follow = None;

    for (key, item) in table.iter() {
        match key {
            "name" => name = Some(parse_toml_string(key, item)?),
            "host" => host = Some(parse_toml_string(key, item)?),
            "port" => port = Some(parse_toml_u64(key, item)? as u16),
            "user" => user = Some(parse_toml_string(key, item)?),
            "follow" => follow = Some(parse_toml_string(key, item)?),
            other => bail!("unrecognised server option '{other}'"),
        }
    }

    Ok(ServerConfig {
        name: name.context("server entry missing 'name'")?,
        host: host.context("server entry missing 'host'")?,
        port: port.context("server entry missing 'port'")? ,
        user: user.context("server entry missing 'user'")?,
        follow,
    })
}

/// Parses and validates `pgmoneta.toml`. Leaves any option not present in
/// the file at its built-in default; rejects any key it does not
/// recognise (spec.md §7 `ConfigError` is fatal, the process exits
/// non-zero).
pub fn parse_and_validate(toml: &Document) -> anyhow::Result<Config> {
    let mut builder = ConfigBuilder::default();

    for (key, item) in toml.iter() {
        match key {
            "base_dir" => builder.base_dir = Some(Utf8PathBuf::from(parse_toml_string(key, item)?)),
            "unix_socket_dir" => {
                builder.unix_socket_dir = Some(Utf8PathBuf::from(parse_toml_string(key, item)?))
            }
            "admin_listen_addr" => builder.admin_listen_addr = Some(parse_toml_string(key, item)?),
            "workers" => builder.workers = Some(parse_toml_u64(key, item)? as usize),
            "authentication_timeout" => {
                builder.authentication_timeout = Some(parse_toml_duration_secs(key, item)?)
            }
            "retention_interval" => {
                builder.retention_interval = Some(parse_toml_duration_secs(key, item)?)
            }
            "verification_interval" => {
                builder.verification_interval = Some(parse_toml_duration_secs(key, item)?)
            }
            "users_path" => {
                builder.users_path = Some(Utf8PathBuf::from(parse_toml_string(key, item)?))
            }
            "server" => {
                let array = item
                    .as_array_of_tables()
                    .context("'server' must be an array of tables ([[server]])")?;
                for table in array.iter() {
                    builder.servers.push(parse_server(table)?);
                }
            }
            other => bail!("unrecognised configuration option '{other}'"),
        }
    }

    builder.build()
}

pub fn load(config_dir: &Utf8Path) -> anyhow::Result<Config> {
    let path = config_dir.join("pgmoneta.toml");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading configuration file '{path}'"))?;
    let doc: Document = text
        .parse()
        .with_context(|| format!("parsing configuration file '{path}'"))?;
    parse_and_validate(&doc)
}

/// Resolves the configuration directory: an explicit `-D` flag wins,
/// otherwise `PGMONETA_CONFIG_DIR` (spec.md §6 "Environment").
pub fn resolve_config_dir(explicit: Option<&str>) -> anyhow::Result<Utf8PathBuf> {
    if let Some(dir) = explicit {
        return Ok(Utf8PathBuf::from(dir));
    }
    std::env::var("PGMONETA_CONFIG_DIR")
        .map(Utf8PathBuf::from)
        .context("no configuration directory given: pass -D or set PGMONETA_CONFIG_DIR")
}

/// Resolves the credentials file: an explicit `-u` flag wins, otherwise
/// `users_path` from `pgmoneta.toml`, otherwise `<config_dir>/pgmoneta_users.conf`
/// (mirroring `resolve_config_dir`'s precedence, per the origin's
/// `-u`/`--users` flag and its config-relative default).
pub fn resolve_users_path(explicit: Option<&str>, config: &Config, config_dir: &Utf8Path) -> Utf8PathBuf {
    if let Some(path) = explicit {
        return Utf8PathBuf::from(path);
    }
    config
        .users_path
        .clone()
        .unwrap_or_else(|| config_dir.join("pgmoneta_users.conf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let text = r#"
base_dir = "/var/lib/pgmoneta"
unix_socket_dir = "/tmp"
workers = 4

[[server]]
name = "primary"
host = "127.0.0.1"
port = 5432
user = "repl"
"#;
        let doc: Document = text.parse().unwrap();
        let config = parse_and_validate(&doc).unwrap();
        assert_eq!(config.base_dir, Utf8PathBuf::from("/var/lib/pgmoneta"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].port, 5432);
        assert_eq!(config.retention_interval, Duration::from_secs(3600));
    }

    #[test]
    fn unrecognised_key_is_a_config_error() {
        let text = "base_dir = \"/x\"\nunix_socket_dir = \"/tmp\"\nbogus_option = 1\n";
        let doc: Document = text.parse().unwrap();
        assert!(parse_and_validate(&doc).is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let text = "base_dir = \"/x\"\n";
        let doc: Document = text.parse().unwrap();
        assert!(parse_and_validate(&doc).is_err());
    }
}
