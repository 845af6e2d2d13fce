//! Daemon configuration with compiled-in defaults.
//!
//! # File format
//!
//! ```text
//! # anything the operator writes here survives the rewrite
//! [server]
//! address = "0.0.0.0"
//! port = 9090
//! descriptor = "/etc/mediad/pattern.sdp"
//! threads = 15
//! ```
//!
//! # Load contract
//!
//! - Missing file: an empty one is created and every key takes its default.
//! - Unparsable file (bad TOML or not UTF-8): defaults are used, the file is
//!   left untouched and codec negotiation is disabled
//!   ([`Config::codecs_enabled`] is `false`).
//! - Missing or invalid key: the default is substituted and written back.
//!
//! After all keys are resolved the document is persisted once, keeping unknown
//! groups, unknown keys and comments exactly as they were.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Serialize;
use toml_edit::{DocumentMut, Item, Table};

use crate::error::{config_io_err, ConfigError, ValueError};

// ---------------------------------------------------------------------------
// Keys and defaults
// ---------------------------------------------------------------------------

pub const SERVER_GROUP: &str = "server";
pub const ADDRESS_KEY: &str = "address";
pub const PORT_KEY: &str = "port";
pub const DESCRIPTOR_KEY: &str = "descriptor";
pub const THREADS_KEY: &str = "threads";

pub const DEFAULT_CONFIG_FILE: &str = "/etc/mediad/mediad.conf";
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PORT: u16 = 9090;
pub const DEFAULT_DESCRIPTOR_FILE: &str = "/etc/mediad/pattern.sdp";
pub const DEFAULT_THREADS: usize = 15;
pub const MAX_THREADS: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Typed view of the `[server]` group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSettings {
    pub address: IpAddr,
    pub port: u16,
    /// Descriptor path as written in the file (may be relative).
    pub descriptor: PathBuf,
    pub threads: usize,
}

impl ServerSettings {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
            descriptor: PathBuf::from(DEFAULT_DESCRIPTOR_FILE),
            threads: DEFAULT_THREADS,
        }
    }
}

/// A raw value as stored in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    String(String),
    Integer(i64),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::String(s) => s.fmt(f),
            ConfigValue::Integer(i) => i.fmt(f),
        }
    }
}

/// Resolved configuration. Read-only once [`load`] returns.
#[derive(Debug, Clone)]
pub struct Config {
    path: PathBuf,
    server: ServerSettings,
    codecs_enabled: bool,
    document: DocumentMut,
}

impl Config {
    /// All-default configuration bound to `path`, with codecs enabled.
    pub fn defaults(path: impl Into<PathBuf>) -> Self {
        let mut document = DocumentMut::new();
        let server = ServerSettings::default();
        write_settings(&mut document, &server);
        Self {
            path: path.into(),
            server,
            codecs_enabled: true,
            document,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn server(&self) -> &ServerSettings {
        &self.server
    }

    /// `false` when the file could not be parsed; the descriptor must not be loaded.
    pub fn codecs_enabled(&self) -> bool {
        self.codecs_enabled
    }

    /// Descriptor path, relative paths resolved against the config file's directory.
    pub fn descriptor_path(&self) -> PathBuf {
        let descriptor = &self.server.descriptor;
        if descriptor.is_absolute() {
            return descriptor.clone();
        }
        match self.path.parent() {
            Some(dir) => dir.join(descriptor),
            None => descriptor.clone(),
        }
    }

    /// Look up any key, including groups this daemon does not interpret.
    pub fn value(&self, group: &str, key: &str) -> Option<ConfigValue> {
        let item = self.document.get(group)?.as_table_like()?.get(key)?;
        if let Some(s) = item.as_str() {
            return Some(ConfigValue::String(s.to_owned()));
        }
        item.as_integer().map(ConfigValue::Integer)
    }

}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load the configuration at `path`, substituting defaults wherever needed.
///
/// Only I/O failures on an existing file (permission denied, path is a
/// directory, ...) are returned as errors.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    tracing::info!(path = %path.display(), "reading configuration");

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "config file not found, creating a new one");
            create_empty(path);
            Vec::new()
        }
        Err(err) => return Err(config_io_err(path, err)),
    };

    let mut document = match parse_document(bytes) {
        Ok(document) => document,
        Err(reason) => {
            tracing::warn!(
                path = %path.display(),
                error = %reason,
                "error loading configuration, using default server config but no codecs will be available",
            );
            let mut config = Config::defaults(path);
            config.codecs_enabled = false;
            return Ok(config);
        }
    };

    let server = resolve_settings(&mut document);

    let config = Config {
        path: path.to_path_buf(),
        server,
        codecs_enabled: true,
        document,
    };

    if let Err(err) = persist(&config) {
        tracing::warn!(error = %err, "could not write configuration back");
    }

    tracing::info!(
        address = %config.server.address,
        port = config.server.port,
        descriptor = %config.server.descriptor.display(),
        threads = config.server.threads,
        "configuration loaded",
    );
    tracing::debug!("final config file:\n{}", config.document);
    Ok(config)
}

/// Bad encoding and bad syntax are the same failure to the caller.
fn parse_document(bytes: Vec<u8>) -> Result<DocumentMut, String> {
    let text = String::from_utf8(bytes).map_err(|err| format!("not valid UTF-8: {err}"))?;
    text.parse::<DocumentMut>().map_err(|err| err.to_string())
}

/// Write the document back to [`Config::path`] through a sibling `.tmp` file.
///
/// Symlinks are followed so the real file is replaced, and its permissions
/// carry over to the new contents.
pub fn persist(config: &Config) -> Result<(), ConfigError> {
    let target = fs::canonicalize(config.path()).unwrap_or_else(|_| config.path().to_path_buf());
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mediad.conf".to_string());
    let tmp = target.with_file_name(format!("{file_name}.tmp"));

    fs::write(&tmp, config.document.to_string()).map_err(|e| config_io_err(&tmp, e))?;
    if let Ok(metadata) = fs::metadata(&target) {
        if let Err(err) = fs::set_permissions(&tmp, metadata.permissions()) {
            let _ = fs::remove_file(&tmp);
            return Err(config_io_err(&tmp, err));
        }
    }
    fs::rename(&tmp, &target).map_err(|e| config_io_err(&target, e))
}

fn create_empty(path: &Path) {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if let Err(err) = fs::create_dir_all(dir) {
            tracing::warn!(path = %dir.display(), error = %err, "could not create config directory");
            return;
        }
    }
    if let Err(err) = fs::OpenOptions::new().create(true).write(true).open(path) {
        tracing::warn!(path = %path.display(), error = %err, "could not create config file");
    }
}

// ---------------------------------------------------------------------------
// Key resolution
// ---------------------------------------------------------------------------

fn resolve_settings(document: &mut DocumentMut) -> ServerSettings {
    let address = resolve(document, ADDRESS_KEY, DEFAULT_ADDRESS, read_address, |a| {
        toml_edit::Value::from(a.to_string())
    });
    let port = resolve(document, PORT_KEY, DEFAULT_PORT, read_port, |p| {
        toml_edit::Value::from(i64::from(*p))
    });
    let descriptor = resolve(
        document,
        DESCRIPTOR_KEY,
        PathBuf::from(DEFAULT_DESCRIPTOR_FILE),
        read_descriptor,
        |d| toml_edit::Value::from(d.to_string_lossy().into_owned()),
    );
    let threads = resolve(document, THREADS_KEY, DEFAULT_THREADS, read_threads, |t| {
        toml_edit::Value::from(*t as i64)
    });

    ServerSettings {
        address,
        port,
        descriptor,
        threads,
    }
}

/// Read one key; on `NotFound`/`Invalid` record the default in the document.
fn resolve<T>(
    document: &mut DocumentMut,
    key: &'static str,
    default: T,
    read: impl FnOnce(&Item) -> Result<T, String>,
    encode: impl FnOnce(&T) -> toml_edit::Value,
) -> T {
    let outcome = match lookup(document, key) {
        Some(item) => read(item).map_err(|reason| ValueError::Invalid {
            group: SERVER_GROUP,
            key,
            reason,
        }),
        None => Err(ValueError::NotFound {
            group: SERVER_GROUP,
            key,
        }),
    };

    match outcome {
        Ok(value) => value,
        Err(err) => {
            tracing::info!(error = %err, key, "setting default value");
            set_value(document, key, encode(&default));
            default
        }
    }
}

fn lookup<'a>(document: &'a DocumentMut, key: &str) -> Option<&'a Item> {
    document
        .get(SERVER_GROUP)
        .and_then(Item::as_table_like)
        .and_then(|table| table.get(key))
}

fn set_value(document: &mut DocumentMut, key: &str, mut value: toml_edit::Value) {
    if let Some(table) = document
        .get_mut(SERVER_GROUP)
        .and_then(Item::as_table_like_mut)
    {
        match table.get_mut(key) {
            Some(item) => {
                // Keep the trailing comment of the value being replaced.
                if let Some(old) = item.as_value() {
                    *value.decor_mut() = old.decor().clone();
                }
                *item = Item::Value(value);
            }
            None => {
                table.insert(key, Item::Value(value));
            }
        }
        return;
    }

    let mut table = Table::new();
    table.insert(key, Item::Value(value));
    document.insert(SERVER_GROUP, Item::Table(table));
}

fn write_settings(document: &mut DocumentMut, settings: &ServerSettings) {
    set_value(document, ADDRESS_KEY, settings.address.to_string().into());
    set_value(document, PORT_KEY, i64::from(settings.port).into());
    set_value(
        document,
        DESCRIPTOR_KEY,
        settings.descriptor.to_string_lossy().into_owned().into(),
    );
    set_value(document, THREADS_KEY, (settings.threads as i64).into());
}

fn read_address(item: &Item) -> Result<IpAddr, String> {
    let raw = item.as_str().ok_or("expected a string")?;
    raw.trim()
        .parse()
        .map_err(|err| format!("'{raw}' is not an IP address: {err}"))
}

fn read_port(item: &Item) -> Result<u16, String> {
    let raw = item.as_integer().ok_or("expected an integer")?;
    match u16::try_from(raw) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(format!("{raw} is outside 1..=65535")),
    }
}

fn read_descriptor(item: &Item) -> Result<PathBuf, String> {
    let raw = item.as_str().ok_or("expected a string")?;
    if raw.trim().is_empty() {
        return Err("path is empty".to_string());
    }
    Ok(PathBuf::from(raw))
}

fn read_threads(item: &Item) -> Result<usize, String> {
    let raw = item.as_integer().ok_or("expected an integer")?;
    match usize::try_from(raw) {
        Ok(threads) if (1..=MAX_THREADS).contains(&threads) => Ok(threads),
        _ => Err(format!("{raw} is outside 1..={MAX_THREADS}")),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(text: &str) -> DocumentMut {
        text.parse().expect("valid toml")
    }

    #[test]
    fn resolve_keeps_valid_values() {
        let mut doc = parse("[server]\naddress = \"127.0.0.1\"\nport = 7000\nthreads = 4\n");
        let settings = resolve_settings(&mut doc);
        assert_eq!(settings.address, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.threads, 4);
        assert_eq!(settings.descriptor, PathBuf::from(DEFAULT_DESCRIPTOR_FILE));
    }

    #[test]
    fn resolve_creates_group_when_absent() {
        let mut doc = parse("");
        resolve_settings(&mut doc);
        let text = doc.to_string();
        assert!(text.contains("[server]"), "got:\n{text}");
        assert!(text.contains("port = 9090"), "got:\n{text}");
    }

    #[test]
    fn resolve_replaces_non_table_group() {
        let mut doc = parse("server = 3\n");
        let settings = resolve_settings(&mut doc);
        assert_eq!(settings, ServerSettings::default());
        assert!(doc.get(SERVER_GROUP).and_then(Item::as_table_like).is_some());
    }

    #[test]
    fn set_value_keeps_trailing_comment() {
        let mut doc = parse("[server]\nport = 0 # chosen by ops\n");
        resolve_settings(&mut doc);
        let text = doc.to_string();
        assert!(text.contains("port = 9090 # chosen by ops"), "got:\n{text}");
    }

    #[test]
    fn port_rejects_zero_and_overflow() {
        assert!(read_port(&toml_edit::value(0)).is_err());
        assert!(read_port(&toml_edit::value(65536)).is_err());
        assert!(read_port(&toml_edit::value(-1)).is_err());
        assert_eq!(read_port(&toml_edit::value(65535)), Ok(65535));
    }

    #[test]
    fn relative_descriptor_resolves_next_to_config() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("mediad.conf");
        fs::write(&path, "[server]\ndescriptor = \"pattern.sdp\"\n").expect("write");
        let config = load(&path).expect("load");
        assert_eq!(config.descriptor_path(), dir.path().join("pattern.sdp"));
    }

    #[test]
    fn unreadable_path_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }), "got: {err}");
    }

    #[test]
    fn invalid_utf8_is_a_parse_failure() {
        let reason = parse_document(b"[server]\nport = 7000\n# caf\xe9\n".to_vec()).unwrap_err();
        assert!(reason.contains("UTF-8"), "got: {reason}");
        assert!(parse_document(b"[server]\nport = 7000\n".to_vec()).is_ok());
    }

    #[test]
    fn value_error_messages_name_the_key() {
        let err = ValueError::NotFound {
            group: SERVER_GROUP,
            key: PORT_KEY,
        };
        assert!(err.to_string().contains("'port'"));
    }
}
