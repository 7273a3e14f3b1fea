//! Routing plugin I/O schema definitions and serialization
//!
//! This module defines the values exchanged between the proxy and its routing
//! plugins. In-process plugins receive them directly; process plugins receive
//! them as one JSON object per line on stdin and answer on stdout.
//!
//! Query text and parameter values are binary safe: they are carried as
//! [`Bytes`] with an explicit length and serialize as JSON byte arrays. Plugins
//! may also answer with a plain JSON string wherever bytes are expected.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Bind parameter encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Text,
    Binary,
}

/// Query bind parameter, read-only for the duration of a routing call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Raw parameter value, may contain zero bytes in binary format
    pub data: Bytes,

    #[serde(default)]
    pub format: Format,
}

impl Parameter {
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            format: Format::Text,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            format: Format::Binary,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One client statement as produced by the upstream parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Statement text
    pub text: Bytes,

    /// Bind parameters, in placeholder order
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Query {
    pub fn new(text: impl Into<Bytes>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Statement text for logging; invalid UTF-8 is replaced.
    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.text)
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Apply a plugin rewrite on top of `original`.
    ///
    /// The rewrite replaces the statement text. A rewrite that carries no
    /// parameters of its own keeps the original bind parameters.
    pub fn rewritten_from(mut self, original: &Query) -> Self {
        if self.parameters.is_empty() {
            self.parameters = original.parameters.clone();
        }
        self
    }
}

/// Database role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Replica,
}

/// One backend entry of the cluster topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub shard: usize,
    pub role: Role,
    pub host: String,
    pub port: u16,
}

/// Cluster topology the query is being routed against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Logical database name
    pub name: String,

    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

impl ClusterConfig {
    /// Number of shards, derived from the highest configured shard index.
    pub fn shards(&self) -> usize {
        self.databases
            .iter()
            .map(|db| db.shard + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn primary(&self, shard: usize) -> Option<&DatabaseConfig> {
        self.databases
            .iter()
            .find(|db| db.shard == shard && db.role == Role::Primary)
    }

    pub fn replicas(&self, shard: usize) -> impl Iterator<Item = &DatabaseConfig> {
        self.databases
            .iter()
            .filter(move |db| db.shard == shard && db.role == Role::Replica)
    }

    /// Check the topology can be routed against.
    ///
    /// Shard indexes must be `0..shards()` with no gaps and each shard needs a
    /// primary, so every id in range names a configured database.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Cluster name cannot be empty".to_string());
        }

        if self.databases.is_empty() {
            return Err(format!("Cluster '{}' has no databases", self.name));
        }

        if let Some(database) = self.databases.iter().find(|db| db.port == 0) {
            return Err(format!(
                "Database {}:{} on shard {} has an invalid port",
                database.host, database.port, database.shard
            ));
        }

        let configured: HashSet<usize> = self.databases.iter().map(|db| db.shard).collect();
        if let Some(missing) = (0..self.shards()).find(|shard| !configured.contains(shard)) {
            return Err(format!(
                "Cluster '{}' has no database for shard {}",
                self.name, missing
            ));
        }

        if let Some(missing) = (0..self.shards()).find(|shard| self.primary(*shard).is_none()) {
            return Err(format!(
                "Shard {} of cluster '{}' has no primary",
                missing, self.name
            ));
        }

        Ok(())
    }
}

/// Kind of input passed to a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// Route a query
    Routing(Query),
}

impl InputKind {
    /// Wire tag of the input kind.
    pub fn code(&self) -> i32 {
        match self {
            InputKind::Routing(_) => 1,
        }
    }
}

/// Plugin input, built once per query and shared by every plugin in the chain
#[derive(Debug, Clone)]
pub struct Input {
    pub config: Arc<ClusterConfig>,
    pub kind: InputKind,
}

impl Input {
    pub fn routing(config: Arc<ClusterConfig>, query: Query) -> Self {
        Self {
            config,
            kind: InputKind::Routing(query),
        }
    }

    pub fn query(&self) -> &Query {
        match &self.kind {
            InputKind::Routing(query) => query,
        }
    }

    /// Serialize to a JSON line for process plugins
    pub fn to_json(&self) -> Result<String, PluginError> {
        let wire = WireInput {
            config: &self.config,
            input_type: self.kind.code(),
            query: self.query(),
        };

        serde_json::to_string(&wire).map_err(|e| PluginError::IoError {
            reason: format!("Failed to serialize input: {e}"),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInput<'a> {
    config: &'a ClusterConfig,
    input_type: i32,
    query: &'a Query,
}

/// Access mode of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Affinity {
    Read,
    Write,
    TransactionStart,
    TransactionEnd,
    /// Not determined; never authoritative
    Unknown,
}

impl Affinity {
    pub fn is_known(&self) -> bool {
        !matches!(self, Affinity::Unknown)
    }

    /// Interpretation used by backend selection: anything that isn't
    /// known to be a read goes to the primary.
    pub fn fail_safe(self) -> Affinity {
        match self {
            Affinity::Unknown => Affinity::Write,
            known => known,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Affinity::Read)
    }
}

impl From<Affinity> for i32 {
    fn from(value: Affinity) -> Self {
        match value {
            Affinity::Read => 1,
            Affinity::Write => 2,
            Affinity::TransactionStart => 3,
            Affinity::TransactionEnd => 4,
            Affinity::Unknown => -1,
        }
    }
}

impl TryFrom<i32> for Affinity {
    type Error = PluginError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Affinity::Read,
            2 => Affinity::Write,
            3 => Affinity::TransactionStart,
            4 => Affinity::TransactionEnd,
            -1 => Affinity::Unknown,
            other => {
                return Err(PluginError::InvalidOutput {
                    reason: format!("unknown affinity {other}"),
                })
            }
        })
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Affinity::Read => "read",
            Affinity::Write => "write",
            Affinity::TransactionStart => "transaction_start",
            Affinity::TransactionEnd => "transaction_end",
            Affinity::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Target shard of a route.
///
/// On the wire a non-negative integer is a concrete shard, `-1` is ANY and
/// `-2` is ALL. The sentinels never leave the conversion functions below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Shard {
    Concrete(usize),
    Any,
    All,
}

const SHARD_ANY: i64 = -1;
const SHARD_ALL: i64 = -2;

impl From<Shard> for i64 {
    fn from(value: Shard) -> Self {
        match value {
            Shard::Concrete(shard) => shard as i64,
            Shard::Any => SHARD_ANY,
            Shard::All => SHARD_ALL,
        }
    }
}

impl TryFrom<i64> for Shard {
    type Error = PluginError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            SHARD_ANY => Ok(Shard::Any),
            SHARD_ALL => Ok(Shard::All),
            shard if shard >= 0 => usize::try_from(shard)
                .map(Shard::Concrete)
                .map_err(|_| PluginError::InvalidOutput {
                    reason: format!("shard {shard} out of range"),
                }),
            other => Err(PluginError::InvalidOutput {
                reason: format!("invalid shard sentinel {other}"),
            }),
        }
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shard::Concrete(shard) => write!(f, "{shard}"),
            Shard::Any => f.write_str("any"),
            Shard::All => f.write_str("all"),
        }
    }
}

/// Routing instruction returned with a FORWARD decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub affinity: Affinity,
    pub shard: Shard,
}

impl Route {
    pub fn new(shard: Shard, affinity: Affinity) -> Self {
        Self { affinity, shard }
    }

    pub fn read(shard: Shard) -> Self {
        Self::new(shard, Affinity::Read)
    }

    pub fn write(shard: Shard) -> Self {
        Self::new(shard, Affinity::Write)
    }
}

/// Error returned to the client instead of executing the query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Severity, e.g. ERROR or FATAL
    pub severity: String,

    /// SQLSTATE code
    pub code: String,

    pub message: String,

    #[serde(default)]
    pub detail: String,
}

impl ErrorResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".to_string(),
            code: code.into(),
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// One column value of a synthesized row, `None` is SQL NULL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireRowColumn", into = "WireRowColumn")]
pub struct RowColumn(pub Option<Bytes>);

impl RowColumn {
    pub fn null() -> Self {
        Self(None)
    }

    pub fn value(data: impl Into<Bytes>) -> Self {
        Self(Some(data.into()))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// Wire length; -1 for NULL, `None` when the value is too long for a
    /// DataRow column.
    pub fn length(&self) -> Option<i32> {
        match &self.0 {
            Some(data) => i32::try_from(data.len()).ok(),
            None => Some(-1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRowColumn {
    length: i64,

    #[serde(default)]
    data: Bytes,
}

impl TryFrom<WireRowColumn> for RowColumn {
    type Error = PluginError;

    fn try_from(value: WireRowColumn) -> Result<Self, Self::Error> {
        if value.length < 0 {
            return Ok(RowColumn::null());
        }

        if usize::try_from(value.length).ok() != Some(value.data.len()) {
            return Err(PluginError::InvalidOutput {
                reason: format!(
                    "column declares {} bytes but carries {}",
                    value.length,
                    value.data.len()
                ),
            });
        }

        Ok(RowColumn(Some(value.data)))
    }
}

impl From<RowColumn> for WireRowColumn {
    fn from(value: RowColumn) -> Self {
        match value.0 {
            Some(data) => WireRowColumn {
                length: i64::try_from(data.len()).unwrap_or(i64::MAX),
                data,
            },
            None => WireRowColumn {
                length: -1,
                data: Bytes::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub columns: Vec<RowColumn>,
}

impl Row {
    pub fn new(columns: Vec<RowColumn>) -> Self {
        Self { columns }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDescriptionColumn {
    pub name: String,

    /// Type OID
    pub oid: i32,
}

impl RowDescriptionColumn {
    pub fn new(name: impl Into<String>, oid: i32) -> Self {
        Self {
            name: name.into(),
            oid,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDescription {
    pub columns: Vec<RowDescriptionColumn>,
}

impl RowDescription {
    pub fn new(columns: Vec<RowDescriptionColumn>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Result set synthesized by a plugin in place of backend execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intercept {
    pub row_description: RowDescription,

    #[serde(default)]
    pub rows: Vec<Row>,
}

/// Discriminant of a plugin output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Forward,
    Rewrite,
    Error,
    Intercept,
    NoDecision,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Forward => "forward",
            Decision::Rewrite => "rewrite",
            Decision::Error => "error",
            Decision::Intercept => "intercept",
            Decision::NoDecision => "no_decision",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing decision of one plugin, with the payload that decision carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireOutput", into = "WireOutput")]
pub enum Output {
    /// Send the query to the routed shard(s)
    Forward(Route),
    /// Replace the query text
    Rewrite(Query),
    /// Deny the query; the error goes to the client
    Error(ErrorResponse),
    /// Answer the query with these rows; no backend is contacted
    Intercept(Intercept),
    /// Let the next plugin decide
    NoDecision,
}

impl Output {
    pub fn decision(&self) -> Decision {
        match self {
            Output::Forward(_) => Decision::Forward,
            Output::Rewrite(_) => Decision::Rewrite,
            Output::Error(_) => Decision::Error,
            Output::Intercept(_) => Decision::Intercept,
            Output::NoDecision => Decision::NoDecision,
        }
    }

    pub fn is_decisive(&self) -> bool {
        !matches!(self, Output::NoDecision)
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, PluginError> {
        serde_json::from_str(json).map_err(|e| PluginError::InvalidOutput {
            reason: format!("Failed to parse output JSON: {e}"),
        })
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, PluginError> {
        serde_json::to_string(self).map_err(|e| PluginError::IoError {
            reason: format!("Failed to serialize output: {e}"),
        })
    }
}

/// Flat wire form of [`Output`]; exactly the member named by `decision` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireOutput {
    decision: Decision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    route: Option<Route>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorResponse>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    intercept: Option<Intercept>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    query: Option<Query>,
}

impl TryFrom<WireOutput> for Output {
    type Error = PluginError;

    fn try_from(wire: WireOutput) -> Result<Self, PluginError> {
        let populated = [
            ("route", wire.route.is_some()),
            ("error", wire.error.is_some()),
            ("intercept", wire.intercept.is_some()),
            ("query", wire.query.is_some()),
        ];
        let expected = match wire.decision {
            Decision::Forward => Some("route"),
            Decision::Rewrite => Some("query"),
            Decision::Error => Some("error"),
            Decision::Intercept => Some("intercept"),
            Decision::NoDecision => None,
        };

        for (member, present) in populated {
            if present != (Some(member) == expected) {
                return Err(PluginError::InvalidOutput {
                    reason: format!(
                        "decision '{}' {} payload '{}'",
                        wire.decision,
                        if present { "does not take" } else { "requires" },
                        member
                    ),
                });
            }
        }

        // Presence was checked above, so the matching member is set.
        let mismatch = || PluginError::InvalidOutput {
            reason: format!("decision '{}' payload missing", wire.decision),
        };
        Ok(match wire.decision {
            Decision::Forward => Output::Forward(wire.route.ok_or_else(mismatch)?),
            Decision::Rewrite => Output::Rewrite(wire.query.ok_or_else(mismatch)?),
            Decision::Error => Output::Error(wire.error.ok_or_else(mismatch)?),
            Decision::Intercept => Output::Intercept(wire.intercept.ok_or_else(mismatch)?),
            Decision::NoDecision => Output::NoDecision,
        })
    }
}

impl From<Output> for WireOutput {
    fn from(output: Output) -> Self {
        let mut wire = WireOutput {
            decision: output.decision(),
            route: None,
            error: None,
            intercept: None,
            query: None,
        };

        match output {
            Output::Forward(route) => wire.route = Some(route),
            Output::Rewrite(query) => wire.query = Some(query),
            Output::Error(error) => wire.error = Some(error),
            Output::Intercept(intercept) => wire.intercept = Some(intercept),
            Output::NoDecision => {}
        }

        wire
    }
}

/// Plugin faults. The chain treats these as "no decision" unless configured
/// to be fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    /// Plugin timed out
    #[error("Plugin timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Plugin process failed to spawn
    #[error("Failed to spawn plugin process: {reason}")]
    SpawnFailed { reason: String },

    /// Plugin panicked or its process died mid-call
    #[error("Plugin crashed: {reason}")]
    Crashed { reason: String },

    /// Plugin returned output that violates the protocol
    #[error("Plugin returned invalid output: {reason}")]
    InvalidOutput { reason: String },

    /// Plugin I/O error (stdin/stdout)
    #[error("Plugin I/O error: {reason}")]
    IoError { reason: String },

    /// Plugin configuration error
    #[error("Plugin configuration error: {reason}")]
    ConfigError { reason: String },

    /// Plugin not registered
    #[error("Plugin '{name}' not found")]
    NotFound { name: String },

    /// Semaphore acquisition failed
    #[error("Plugin execution pool exhausted")]
    PoolExhausted,

    /// Routing call made before the plugins were initialized
    #[error("Plugins have not been initialized")]
    NotInitialized,

    /// Routing call made after the plugins were shut down
    #[error("Plugins have been shut down")]
    ShutDown,
}

impl PluginError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginError::Timeout { .. } => "timeout",
            PluginError::SpawnFailed { .. } => "spawn_failed",
            PluginError::Crashed { .. } => "crashed",
            PluginError::InvalidOutput { .. } => "invalid_output",
            PluginError::IoError { .. } => "io_error",
            PluginError::ConfigError { .. } => "config_error",
            PluginError::NotFound { .. } => "not_found",
            PluginError::PoolExhausted => "pool_exhausted",
            PluginError::NotInitialized => "not_initialized",
            PluginError::ShutDown => "shut_down",
        }
    }
}
