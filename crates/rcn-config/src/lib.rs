//! Configuration for the RCN graph builder.
//!
//! Every section is optional in the TOML file; missing keys take the defaults
//! documented on each field.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

mod diagnostics;

pub use diagnostics::{ConfigDiagnostics, ConfigWarning};

/// Top-level configuration.
///
/// ```toml
/// [logging]
/// level = "rcn.graph=debug,info"
///
/// [jdwp]
/// reply_timeout_ms = 30000
///
/// [mapping]
/// limit_sdk = true
/// deep_fields = ["SysLoader-com.example.Cache.entries"]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RcnConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Connection and pipelining settings for the debuggee session.
    #[serde(default)]
    pub jdwp: JdwpConfig,

    /// Which parts of the debuggee end up in a snapshot.
    #[serde(default)]
    pub mapping: MappingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while stderr
    /// logging stays active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective `EnvFilter`, with `RUST_LOG` merged in when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JdwpConfig {
    #[serde(default = "JdwpConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "JdwpConfig::default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Upper bound on requests awaiting a reply at once.
    #[serde(default = "JdwpConfig::default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "JdwpConfig::default_event_channel_size")]
    pub event_channel_size: usize,
}

impl JdwpConfig {
    fn default_handshake_timeout_ms() -> u64 {
        5_000
    }

    fn default_reply_timeout_ms() -> u64 {
        10_000
    }

    fn default_max_in_flight() -> usize {
        32
    }

    fn default_event_channel_size() -> usize {
        64
    }

    pub fn client_config(&self) -> rcn_jdwp::JdwpClientConfig {
        rcn_jdwp::JdwpClientConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            max_in_flight: self.max_in_flight.max(1),
            event_channel_size: self.event_channel_size.max(1),
        }
    }
}

impl Default for JdwpConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            reply_timeout_ms: Self::default_reply_timeout_ms(),
            max_in_flight: Self::default_max_in_flight(),
            event_channel_size: Self::default_event_channel_size(),
        }
    }
}

/// How to tell a static member type from an instance (inner) member type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NestingCriterion {
    /// Trust the `static` modifier when the enclosing type lists the member
    /// in its nested types; fall back to the synthetic outer-instance field.
    #[default]
    PreferModifier,
    /// Only the synthetic `this$N` field decides.
    SyntheticField,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Packages (name prefixes) whose types are left out entirely.
    #[serde(default)]
    pub excluded_packages: Vec<String>,

    /// Packages whose non-public types and members are left out.
    #[serde(default)]
    pub shallow_packages: Vec<String>,

    /// Field or local variable RCN prefixes whose collections are walked element by element.
    #[serde(default)]
    pub deep_fields: Vec<String>,

    /// Exclude JDK internals and keep only the public surface of `java.*`.
    #[serde(default)]
    pub limit_sdk: bool,

    /// Stop walking after this many reference hops from a root.
    #[serde(default)]
    pub max_depth: Option<usize>,

    #[serde(default = "MappingConfig::default_max_array_elements")]
    pub max_array_elements: usize,

    /// Suspend the debuggee while a snapshot is captured.
    #[serde(default = "MappingConfig::default_suspend_vm")]
    pub suspend_vm: bool,

    #[serde(default)]
    pub nesting_criterion: NestingCriterion,

    /// Types resolved concurrently while computing a closure.
    #[serde(default = "MappingConfig::default_resolve_concurrency")]
    pub resolve_concurrency: usize,
}

impl MappingConfig {
    fn default_max_array_elements() -> usize {
        256
    }

    fn default_suspend_vm() -> bool {
        true
    }

    fn default_resolve_concurrency() -> usize {
        8
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            excluded_packages: Vec::new(),
            shallow_packages: Vec::new(),
            deep_fields: Vec::new(),
            limit_sdk: false,
            max_depth: None,
            max_array_elements: Self::default_max_array_elements(),
            suspend_vm: Self::default_suspend_vm(),
            nesting_criterion: NestingCriterion::default(),
            resolve_concurrency: Self::default_resolve_concurrency(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a source snippet; keep only the message.
        ConfigError::Toml(err.message().trim().to_owned())
    }
}

impl RcnConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = read_config_file(path.as_ref())?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a config file and report unknown keys and suspicious values.
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let text = read_config_file(path.as_ref())?;
        Self::load_from_str_with_diagnostics(&text)
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (config, unknown_keys) =
            diagnostics::deserialize_toml_with_unknown_keys::<RcnConfig>(text)?;
        let diagnostics = ConfigDiagnostics {
            unknown_keys,
            warnings: config.validate(),
        };
        Ok((config, diagnostics))
    }

    /// Values that parse but will not behave the way they read.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let normalized = LoggingConfig::normalize_level_directives(&self.logging.level);
        if tracing_subscriber::EnvFilter::try_new(&normalized).is_err() {
            warnings.push(ConfigWarning::LoggingLevelInvalid {
                value: self.logging.level.clone(),
                normalized,
            });
        }

        for (path, value) in [
            ("jdwp.max_in_flight", self.jdwp.max_in_flight),
            ("jdwp.event_channel_size", self.jdwp.event_channel_size),
            ("mapping.resolve_concurrency", self.mapping.resolve_concurrency),
        ] {
            if value == 0 {
                warnings.push(ConfigWarning::InvalidValue {
                    toml_path: path.to_owned(),
                    message: "must be at least 1; using 1".to_owned(),
                });
            }
        }

        for (section, packages) in [
            ("mapping.excluded_packages", &self.mapping.excluded_packages),
            ("mapping.shallow_packages", &self.mapping.shallow_packages),
        ] {
            for (idx, package) in packages.iter().enumerate() {
                if package.trim().is_empty() {
                    warnings.push(ConfigWarning::InvalidValue {
                        toml_path: format!("{section}[{idx}]"),
                        message: "empty package prefix matches every type".to_owned(),
                    });
                }
            }
        }

        warnings
    }
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        MutexFileWriter {
            guard: self.file.lock(),
        }
    }
}

struct MutexFileWriter<'a> {
    guard: parking_lot::MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// Safe to call multiple times; only the first call installs a global
/// subscriber.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config
            .file
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| Arc::new(Mutex::new(file)));
        let file_open_failed = config.file.is_some() && file.is_none();

        let mut make_writer = BoxMakeWriter::new(io::sink);
        if config.stderr {
            // `cargo test` only captures output written through the stdlib print macros.
            if cfg!(debug_assertions) {
                make_writer = BoxMakeWriter::new(
                    make_writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr),
                );
            } else {
                make_writer = BoxMakeWriter::new(make_writer.and(io::stderr));
            }
        }
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(MutexFileMakeWriter { file }));
        }

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = config.file.as_ref() {
                tracing::warn!(
                    target: "rcn.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}
