// SPDX-License-Identifier: Apache-2.0

//! Configuration loading.
//!
//! A configuration directory holds `main.toml` (host identity, sinks,
//! offset store) plus one `*.toml` document per watched file. Everything is
//! validated at load time; any failure is fatal before the agent starts.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MAX_LINE_LEN: usize = 10240;
const DEFAULT_MAX_CONNECTIONS: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("{path}: {reason}")]
    Invalid { path: String, reason: String },
}

impl ConfigError {
    fn invalid(path: &Path, reason: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// Top-level document, `main.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MainConfig {
    /// Shell command whose stdout names this host in emitted records.
    /// Falls back to the system hostname when unset.
    pub host_command: Option<String>,

    /// Path of the persisted offset file.
    pub offsets_file: PathBuf,

    #[serde(default)]
    pub kafka: Option<KafkaConfig>,

    #[serde(default)]
    pub http: Option<HttpConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    /// Comma-separated broker list.
    pub brokers: String,

    /// Free-form librdkafka global properties.
    #[serde(default)]
    pub global: HashMap<String, String>,

    /// Free-form librdkafka topic-level properties.
    #[serde(default)]
    pub topic: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Document-store nodes, `host:port`, tried in order on failover.
    pub nodes: Vec<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_true() -> bool {
    true
}

fn default_max_line_len() -> usize {
    DEFAULT_MAX_LINE_LEN
}

/// Raw per-file document before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDoc {
    file: PathBuf,

    topic: Option<String>,
    index: Option<String>,

    #[serde(default)]
    autosplit: bool,
    #[serde(default = "default_true")]
    withhost: bool,
    #[serde(default = "default_true")]
    withtime: bool,

    /// 1-based field position of the timestamp; negative counts from the
    /// end of the line.
    timeidx: Option<i32>,

    #[serde(default = "default_max_line_len")]
    max_line_len: usize,

    filter: Option<Vec<i32>>,
    transform: Option<ScriptConfig>,
    grep: Option<ScriptConfig>,
    aggregate: Option<ScriptConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptConfig {
    /// Shell command for the script host subprocess.
    pub command: String,
}

/// The single pipeline kind a file resolved to.
#[derive(Debug, Clone)]
pub enum PipelineSpec {
    Raw,
    Transform(ScriptConfig),
    Grep(ScriptConfig),
    Filter(Vec<i32>),
    Aggregate(ScriptConfig),
}

/// Where a file's records go. An index may carry `{time}` / `{date}`
/// placeholders filled from the record's time key.
#[derive(Debug, Clone)]
pub enum RouteSpec {
    Topic(String),
    Index(String),
}

impl RouteSpec {
    pub fn is_templated(&self) -> bool {
        match self {
            RouteSpec::Topic(_) => false,
            RouteSpec::Index(t) => t.contains("{time}") || t.contains("{date}"),
        }
    }
}

/// Validated per-file configuration.
#[derive(Debug, Clone)]
pub struct FileConfig {
    pub file: PathBuf,
    pub route: RouteSpec,
    pub pipeline: PipelineSpec,
    pub autosplit: bool,
    pub withhost: bool,
    pub withtime: bool,
    pub timeidx: Option<i32>,
    pub max_line_len: usize,
}

#[derive(Debug)]
pub struct Config {
    pub main: MainConfig,
    pub files: Vec<FileConfig>,
}

impl Config {
    /// Load and validate a configuration directory.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let main_path = dir.join("main.toml");
        let main: MainConfig = read_doc(&main_path)?;

        if let Some(http) = &main.http {
            if http.nodes.is_empty() {
                return Err(ConfigError::invalid(&main_path, "http.nodes must not be empty"));
            }
            if http.max_connections == 0 {
                return Err(ConfigError::invalid(
                    &main_path,
                    "http.max_connections must be > 0",
                ));
            }
            if http.username.is_some() != http.password.is_some() {
                return Err(ConfigError::invalid(
                    &main_path,
                    "http.username and http.password must be set together",
                ));
            }
        }

        let mut file_paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| ConfigError::Io {
                path: dir.display().to_string(),
                source: e,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().map(|e| e == "toml").unwrap_or(false)
                    && p.file_name().map(|n| n != "main.toml").unwrap_or(false)
            })
            .collect();
        file_paths.sort();

        let mut files = Vec::with_capacity(file_paths.len());
        for path in &file_paths {
            let doc: FileDoc = read_doc(path)?;
            files.push(validate_file(path, doc, &main)?);
        }

        if files.is_empty() {
            return Err(ConfigError::invalid(dir, "no per-file documents found"));
        }

        Ok(Self { main, files })
    }
}

fn read_doc<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: Box::new(e),
    })
}

fn validate_file(path: &Path, doc: FileDoc, main: &MainConfig) -> Result<FileConfig, ConfigError> {
    let route = match (doc.topic, doc.index) {
        (Some(topic), None) => {
            if main.kafka.is_none() {
                return Err(ConfigError::invalid(
                    path,
                    "topic route declared but main.toml has no [kafka] section",
                ));
            }
            RouteSpec::Topic(topic)
        }
        (None, Some(index)) => {
            if main.http.is_none() {
                return Err(ConfigError::invalid(
                    path,
                    "index route declared but main.toml has no [http] section",
                ));
            }
            RouteSpec::Index(index)
        }
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(path, "declare topic or index, not both"))
        }
        (None, None) => return Err(ConfigError::invalid(path, "one of topic or index is required")),
    };

    let mut kinds: Vec<PipelineSpec> = Vec::new();
    if let Some(s) = doc.transform {
        kinds.push(PipelineSpec::Transform(s));
    }
    if let Some(s) = doc.grep {
        kinds.push(PipelineSpec::Grep(s));
    }
    if let Some(f) = doc.filter {
        if f.is_empty() {
            return Err(ConfigError::invalid(path, "filter must not be empty"));
        }
        kinds.push(PipelineSpec::Filter(f));
    }
    if let Some(s) = doc.aggregate {
        kinds.push(PipelineSpec::Aggregate(s));
    }
    if kinds.len() > 1 {
        return Err(ConfigError::invalid(
            path,
            "at most one of transform, grep, filter, aggregate may be declared",
        ));
    }
    let pipeline = kinds.pop().unwrap_or(PipelineSpec::Raw);

    if matches!(pipeline, PipelineSpec::Aggregate(_)) && doc.timeidx.is_none() {
        return Err(ConfigError::invalid(path, "aggregate requires timeidx"));
    }

    if route.is_templated() && doc.timeidx.is_none() {
        return Err(ConfigError::invalid(
            path,
            "templated index requires timeidx",
        ));
    }

    if doc.max_line_len < 2 {
        return Err(ConfigError::invalid(path, "max_line_len is too small"));
    }

    Ok(FileConfig {
        file: doc.file,
        route,
        pipeline,
        autosplit: doc.autosplit,
        withhost: doc.withhost,
        withtime: doc.withtime,
        timeidx: doc.timeidx,
        max_line_len: doc.max_line_len,
    })
}

/// Fill a route's index template from a record's time key.
pub fn resolve_index(template: &str, time_key: Option<&str>) -> String {
    match time_key {
        Some(time) => {
            let date = &time[..time.len().min(10)];
            template.replace("{time}", time).replace("{date}", date)
        }
        None => template.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const MAIN: &str = r#"
host_command = "echo myhost"
offsets_file = "/tmp/offsets"

[kafka]
brokers = "127.0.0.1:9092"
[kafka.global]
"client.id" = "tailpost"
[kafka.topic]
"request.required.acks" = "1"

[http]
nodes = ["127.0.0.1:9200"]
max_connections = 100
"#;

    fn write_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn loads_main_and_file_docs() {
        let dir = write_dir(&[
            ("main.toml", MAIN),
            (
                "basic.toml",
                "file = \"/var/log/basic.log\"\ntopic = \"basic\"\n",
            ),
            (
                "access.toml",
                "file = \"/var/log/access.log\"\nindex = \"web-access\"\nfilter = [4, 5, -1]\ntimeidx = 4\n",
            ),
        ]);

        let cfg = Config::load_dir(dir.path()).unwrap();
        assert_eq!(cfg.main.host_command.as_deref(), Some("echo myhost"));
        let kafka = cfg.main.kafka.as_ref().unwrap();
        assert_eq!(kafka.global.get("client.id").unwrap(), "tailpost");
        assert_eq!(kafka.topic.get("request.required.acks").unwrap(), "1");

        // sorted by document name: access before basic
        assert_eq!(cfg.files.len(), 2);
        assert!(matches!(cfg.files[0].route, RouteSpec::Index(_)));
        assert!(matches!(cfg.files[0].pipeline, PipelineSpec::Filter(_)));
        assert_eq!(cfg.files[0].timeidx, Some(4));
        assert!(matches!(cfg.files[1].route, RouteSpec::Topic(_)));
        assert!(matches!(cfg.files[1].pipeline, PipelineSpec::Raw));
        assert!(cfg.files[1].withhost);
    }

    #[test]
    fn rejects_ambiguous_pipeline() {
        let dir = write_dir(&[
            ("main.toml", MAIN),
            (
                "bad.toml",
                "file = \"/l/x.log\"\ntopic = \"t\"\nfilter = [1]\n[transform]\ncommand = \"c\"\n",
            ),
        ]);
        let err = Config::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_missing_route_and_double_route() {
        let dir = write_dir(&[
            ("main.toml", MAIN),
            ("bad.toml", "file = \"/l/x.log\"\n"),
        ]);
        assert!(Config::load_dir(dir.path()).is_err());

        let dir = write_dir(&[
            ("main.toml", MAIN),
            (
                "bad.toml",
                "file = \"/l/x.log\"\ntopic = \"t\"\nindex = \"i\"\n",
            ),
        ]);
        assert!(Config::load_dir(dir.path()).is_err());
    }

    #[test]
    fn aggregate_requires_timeidx() {
        let dir = write_dir(&[
            ("main.toml", MAIN),
            (
                "agg.toml",
                "file = \"/l/x.log\"\ntopic = \"t\"\n[aggregate]\ncommand = \"c\"\n",
            ),
        ]);
        assert!(Config::load_dir(dir.path()).is_err());
    }

    #[test]
    fn templated_index_requires_timeidx() {
        let dir = write_dir(&[
            ("main.toml", MAIN),
            (
                "tpl.toml",
                "file = \"/l/x.log\"\nindex = \"logs-{date}\"\n",
            ),
        ]);
        assert!(Config::load_dir(dir.path()).is_err());

        let dir = write_dir(&[
            ("main.toml", MAIN),
            (
                "tpl.toml",
                "file = \"/l/x.log\"\nindex = \"logs-{date}\"\ntimeidx = 1\n",
            ),
        ]);
        assert!(Config::load_dir(dir.path()).is_ok());
    }

    #[test]
    fn index_route_needs_http_section() {
        let main = r#"
offsets_file = "/tmp/offsets"
[kafka]
brokers = "b:9092"
"#;
        let dir = write_dir(&[
            ("main.toml", main),
            ("x.toml", "file = \"/l/x.log\"\nindex = \"i\"\n"),
        ]);
        assert!(Config::load_dir(dir.path()).is_err());
    }

    #[test]
    fn resolve_index_fills_placeholders() {
        assert_eq!(
            resolve_index("logs-{date}", Some("2015-04-02T12:05:04")),
            "logs-2015-04-02"
        );
        assert_eq!(
            resolve_index("logs-{time}", Some("2015-04-02T12:05:04")),
            "logs-2015-04-02T12:05:04"
        );
        assert_eq!(resolve_index("static", None), "static");
    }
}
