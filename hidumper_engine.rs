//! # hidumper engine
//!
//! Device diagnostics collector. A declarative catalogue of data sources
//! (proc/sysfs files, shell commands, system-ability dumps, in-process
//! counters) is turned into an execution plan, every plan node is driven
//! through a three-phase executor cycle under a shared timeout budget, and the
//! produced rows are streamed to the console, a file, or a compressed stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              HIDUMPER ENGINE                             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  CLI → OPTIONS → PLAN BUILDER → DISPATCH ENGINE → EXECUTORS → SINK → OUT │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dispatch engine is single-threaded and cooperative: executors only
//! yield between pagination calls (`DumpStatus::MoreData`). The only extra
//! thread is the short-lived pipe reader used while a system ability dumps
//! itself into a file descriptor.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap};
use std::ffi::CStr;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command as ProcessCommand, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam::channel::{bounded, Sender as CrossbeamSender};
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{Local, TimeZone};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "hidumper";
pub const ENGINE_FULL_NAME: &str = "HiDumper Diagnostics Collector";

// ----------------------------------------------------------------------------
// Marker Rows & Templates
// ----------------------------------------------------------------------------

/// Row appended when a node's deadline has passed.
pub const TIME_OUT_STR: &str = "time out";

/// Prefix of the one-time header row a command node emits.
pub const CMD_PREFIX: &str = "cmd is: ";

/// Placeholder substituted with the bound process id.
pub const PID_PLACEHOLDER: &str = "%pid";

/// Placeholder substituted with the bound cpu id.
pub const CPUID_PLACEHOLDER: &str = "%cpuid";

/// Dashes framing an ability banner row.
pub const ABILITY_SEPARATOR: &str = "-------------------------------";

/// Node name of the process stack source, guarded by the user-process rule.
pub const STACK_DUMP_SOURCE: &str = "dumper_stack";

/// Sentinel for unset numeric arguments (pid, uid, cpu id).
pub const INVALID_ID: i32 = -1;

// ----------------------------------------------------------------------------
// Request Defaults & Limits
// ----------------------------------------------------------------------------

/// Default request timeout (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Minimum request timeout (seconds)
pub const MIN_TIMEOUT_SECS: u64 = 1;

/// Default per-source row limit (effectively unlimited)
pub const DEFAULT_ROW_LIMIT: u64 = i32::MAX as u64;

/// Uids below this are treated as privileged for stack dumps
pub const DEFAULT_STACK_MIN_UID: u32 = 1000;

/// Warn when a single node phase runs longer than this (milliseconds)
pub const DEFAULT_SLOW_NODE_MS: u64 = 2000;

// ----------------------------------------------------------------------------
// Output & Compression
// ----------------------------------------------------------------------------

/// Source accumulation buffer of the compressed output (bytes)
pub const DEFAULT_ZIP_BUFFER_SIZE: usize = 64 * 1024;

/// Smallest accepted compressed-output buffer (bytes)
pub const MIN_ZIP_BUFFER_SIZE: usize = 16;

/// Default zstd compression level
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

// ----------------------------------------------------------------------------
// Listing
// ----------------------------------------------------------------------------

/// Column width used by list output
pub const DEFAULT_LIST_NAME_WIDTH: usize = 40;

/// Names printed per list row
pub const DEFAULT_LIST_NAMES_PER_ROW: usize = 3;

/// Built-in data source catalogue, shipped as configuration data.
pub const BUILTIN_CATALOGUE: &str = include_str!("catalogue.toml");

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data flowing through the engine:
// - Execution status codes shared by every executor
// - The append-only row sink outputs consume
// - Config nodes, their arguments, and the plan arena that owns them
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Dump Status
// ----------------------------------------------------------------------------

/// Result code of a single executor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DumpStatus {
    /// Phase completed
    Ok,
    /// Phase failed; the node is skipped
    Fail,
    /// More data is pending; a loopable node is retried
    MoreData,
}

impl Display for DumpStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DumpStatus::Ok => write!(f, "ok"),
            DumpStatus::Fail => write!(f, "fail"),
            DumpStatus::MoreData => write!(f, "more_data"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Rows & Sink
// ----------------------------------------------------------------------------

/// One output line: an ordered list of cells. Zero cells is a blank line.
pub type Row = Vec<String>;

#[derive(Debug, Default)]
struct SinkInner {
    rows: Vec<Row>,
    /// Rows already handed to an output and removed from `rows`
    drained: usize,
}

/// Shared, ordered, append-only row stream of a request.
///
/// Outputs drain the sink; positions are absolute so watermarks taken before
/// a drain stay meaningful afterwards.
#[derive(Debug, Clone, Default)]
pub struct DumpSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl DumpSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row.
    pub fn push_row(&self, row: Row) {
        self.inner.lock().rows.push(row);
    }

    /// Append a single-cell row.
    pub fn push_line(&self, line: impl Into<String>) {
        self.push_row(vec![line.into()]);
    }

    /// Append a zero-cell row.
    pub fn push_blank(&self) {
        self.push_row(Vec::new());
    }

    /// Append the blank / `---[section]---` / blank title block.
    pub fn push_title(&self, section: &str) {
        let mut inner = self.inner.lock();
        inner.rows.push(Vec::new());
        inner.rows.push(vec![format!("---[{}]---", section)]);
        inner.rows.push(Vec::new());
    }

    /// Rows currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute position one past the last row ever appended.
    pub fn end_position(&self) -> usize {
        let inner = self.inner.lock();
        inner.drained + inner.rows.len()
    }

    /// Copy of the buffered rows.
    pub fn snapshot(&self) -> Vec<Row> {
        self.inner.lock().rows.clone()
    }

    /// Take every buffered row.
    pub fn drain(&self) -> Vec<Row> {
        let mut inner = self.inner.lock();
        let rows = std::mem::take(&mut inner.rows);
        inner.drained += rows.len();
        rows
    }

    /// Apply `f` to every still-buffered row at or after absolute position
    /// `from`; returns the new end position.
    pub fn update_since(&self, from: usize, mut f: impl FnMut(&mut Row)) -> usize {
        let mut inner = self.inner.lock();
        let start = from.saturating_sub(inner.drained);
        for row in inner.rows.iter_mut().skip(start) {
            f(row);
        }
        inner.drained + inner.rows.len()
    }
}

// ----------------------------------------------------------------------------
// 3.3 Node Kinds
// ----------------------------------------------------------------------------

/// Identity of a node inside a [`Plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Data-producing executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumperKind {
    /// Shell command output
    Cmd,
    /// File or directory contents
    File,
    /// System ability self-dump through a pipe
    Ability,
    /// Registered name listing
    List(ListKind),
    /// Build and platform properties
    Api,
    /// Tool version
    Version,
}

/// What a list node enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Service,
    Ability,
    System,
}

/// Row transforming stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Strip trailing whitespace from every new cell
    TrimTrailing,
}

/// Terminal row consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Request callback fd, or stdout
    Fd,
    /// Plain file at the node target
    File,
    /// Size-bounded compressed stream on the request fd
    Zip,
}

/// Exactly one of dumper, filter, output or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Dumper(DumperKind),
    Filter(FilterKind),
    Output(OutputKind),
    Group,
}

impl NodeKind {
    pub fn is_dumper(&self) -> bool {
        matches!(self, NodeKind::Dumper(_))
    }

    pub fn is_filter(&self) -> bool {
        matches!(self, NodeKind::Filter(_))
    }

    pub fn is_output(&self) -> bool {
        matches!(self, NodeKind::Output(_))
    }
}

/// How a group's subtree was expanded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestingType {
    #[default]
    None,
    ByPid,
    #[serde(rename = "by_cpuid")]
    ByCpuId,
}

// ----------------------------------------------------------------------------
// 3.4 Node Arguments
// ----------------------------------------------------------------------------

/// Structured payload bound to a node. Each variant carries its value, so a
/// "has" flag can never disagree with its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpArgs {
    /// Process identity; `uid` is [`INVALID_ID`] when unknown
    Pid { pid: i32, uid: i32 },
    CpuId(i32),
    Str(String),
    StrList(Vec<String>),
    /// Parallel name list and forwarded argument list
    NamesAndArgs { names: Vec<String>, args: Vec<String> },
}

impl DumpArgs {
    pub fn pid(&self) -> Option<i32> {
        match self {
            DumpArgs::Pid { pid, .. } if *pid > INVALID_ID => Some(*pid),
            _ => None,
        }
    }

    pub fn uid(&self) -> Option<i32> {
        match self {
            DumpArgs::Pid { uid, .. } if *uid > INVALID_ID => Some(*uid),
            _ => None,
        }
    }

    pub fn cpu_id(&self) -> Option<i32> {
        match self {
            DumpArgs::CpuId(cpu) if *cpu > INVALID_ID => Some(*cpu),
            _ => None,
        }
    }

    pub fn str_value(&self) -> Option<&str> {
        match self {
            DumpArgs::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Names carried by either list variant.
    pub fn names(&self) -> &[String] {
        match self {
            DumpArgs::StrList(names) => names,
            DumpArgs::NamesAndArgs { names, .. } => names,
            _ => &[],
        }
    }

    /// Arguments forwarded to remote dumps.
    pub fn forwarded_args(&self) -> &[String] {
        match self {
            DumpArgs::NamesAndArgs { args, .. } => args,
            _ => &[],
        }
    }
}

/// Replace `%pid` / `%cpuid` with values the args declare; placeholders whose
/// value is absent stay literal.
pub fn substitute_placeholders(template: &str, args: Option<&DumpArgs>) -> String {
    let mut out = template.to_string();
    if let Some(args) = args {
        if let Some(pid) = args.pid() {
            out = out.replace(PID_PLACEHOLDER, &pid.to_string());
        }
        if let Some(cpu) = args.cpu_id() {
            out = out.replace(CPUID_PLACEHOLDER, &cpu.to_string());
        }
    }
    out
}

// ----------------------------------------------------------------------------
// 3.5 Config Node
// ----------------------------------------------------------------------------

/// One entry of the execution plan tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    pub name: String,
    pub desc: String,
    /// Command, path or name template; may contain `%pid` / `%cpuid`
    pub target: String,
    /// Display category used for title blocks
    pub section: String,
    pub kind: NodeKind,
    pub level: u32,
    pub can_loop: bool,
    pub args: Option<DumpArgs>,
    pub nesting: NestingType,
    pub expand: bool,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl DumpConfig {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            desc: String::new(),
            target: String::new(),
            section: String::new(),
            kind,
            level: 0,
            can_loop: false,
            args: None,
            nesting: NestingType::None,
            expand: false,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn dumper(name: impl Into<String>, kind: DumperKind, target: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Dumper(kind)).with_target(target)
    }

    pub fn group(name: impl Into<String>, nesting: NestingType) -> Self {
        let mut node = Self::new(name, NodeKind::Group);
        node.nesting = nesting;
        node
    }

    pub fn output(kind: OutputKind) -> Self {
        Self::new("output", NodeKind::Output(kind))
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = section.into();
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn with_loop(mut self, can_loop: bool) -> Self {
        self.can_loop = can_loop;
        self
    }

    pub fn with_args(mut self, args: DumpArgs) -> Self {
        self.args = Some(args);
        self
    }

    pub fn is_group(&self) -> bool {
        self.kind == NodeKind::Group || !self.children.is_empty()
    }

    pub fn can_loop(&self) -> bool {
        self.can_loop
    }

    pub fn is_dumper(&self) -> bool {
        self.kind.is_dumper()
    }

    pub fn is_filter(&self) -> bool {
        self.kind.is_filter()
    }

    pub fn is_output(&self) -> bool {
        self.kind.is_output()
    }
}

// ----------------------------------------------------------------------------
// 3.6 Plan Arena
// ----------------------------------------------------------------------------

/// Owns every node of a request. Parent links are indices, never pointers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    nodes: Vec<DumpConfig>,
    roots: Vec<NodeId>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, mut node: DumpConfig) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = None;
        node.level = 0;
        self.nodes.push(node);
        self.roots.push(id);
        id
    }

    pub fn add_child(&mut self, parent: NodeId, mut node: DumpConfig) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = Some(parent);
        node.level = self.nodes[parent.0].level + 1;
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &DumpConfig {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DumpConfig {
        &mut self.nodes[id.0]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first, parent-before-children order of every node.
    pub fn flatten(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    /// Number of data-producing nodes.
    pub fn dumper_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_dumper()).count()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem. Executor phases never surface these
// directly: they are logged and mapped to `DumpStatus::Fail` at the executor
// boundary so a single source can never abort a request.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Errors
// ----------------------------------------------------------------------------

/// The main error type for the dumper.
#[derive(Error, Debug)]
pub enum DumperError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid options: {0}")]
    Options(#[from] OptionsError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Ability error: {0}")]
    Ability(#[from] AbilityError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DumperError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            DumperError::Config(_) => false,
            DumperError::Options(_) => false,
            DumperError::Executor(e) => e.is_recoverable(),
            DumperError::Output(_) => false,
            DumperError::Ability(_) => true,
            DumperError::Io(_) => true,
            DumperError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            DumperError::Config(_) => "config",
            DumperError::Options(_) => "options",
            DumperError::Executor(_) => "executor",
            DumperError::Output(_) => "output",
            DumperError::Ability(_) => "ability",
            DumperError::Io(_) => "io",
            DumperError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration and catalogue loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Request Option Errors
// ----------------------------------------------------------------------------

/// Violations of the request option rules
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptionsError {
    #[error("Invalid pid for '{field}': {value}")]
    InvalidPid { field: &'static str, value: i32 },

    #[error("List mode needs a service, system ability or system selection")]
    ListWithoutTarget,

    #[error("Output path must be absolute: {path}")]
    RelativePath { path: String },

    #[error("Timeout must be at least {min} second(s), got {value}")]
    InvalidTimeout { min: u64, value: u64 },

    #[error("Limit must be at least 1")]
    InvalidLimit,

    #[error("Nothing selected to dump")]
    NothingSelected,
}

// ----------------------------------------------------------------------------
// 4.4 Executor Errors
// ----------------------------------------------------------------------------

/// Errors raised inside executor phases
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed { command: String, source: io::Error },

    #[error("Failed to open '{path}': {source}")]
    OpenFailed { path: PathBuf, source: io::Error },

    #[error("No readable file for target '{target}'")]
    NothingToRead { target: String },

    #[error("Stack dump refused for pid {pid}: not a user process")]
    NotUserProcess { pid: i32 },

    #[error("Pipe setup failed: {0}")]
    Pipe(io::Error),

    #[error("Reader thread failed: {message}")]
    ReaderThread { message: String },
}

impl ExecutorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ExecutorError::NotUserProcess { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.5 Output Errors
// ----------------------------------------------------------------------------

/// Errors from output backends
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Output '{name}' has no destination")]
    NoDestination { name: String },

    #[error("Write to '{name}' failed: {source}")]
    WriteFailed { name: String, source: io::Error },

    #[error("Compression failed: {message}")]
    CompressionFailed { message: String },
}

// ----------------------------------------------------------------------------
// 4.6 Ability Errors
// ----------------------------------------------------------------------------

/// Errors from the system-ability registry
#[derive(Error, Debug)]
pub enum AbilityError {
    #[error("System ability '{name}' not found")]
    NotFound { name: String },

    #[error("System ability {id} dump failed: {message}")]
    DumpFailed { id: i32, message: String },
}

// ----------------------------------------------------------------------------
// 4.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for dumper operations
pub type DumperResult<T> = Result<T, DumperError>;

/// Result type for executor internals
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Result type for output internals
pub type OutputResult<T> = Result<T, OutputError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Tool configuration with:
// - TOML file parsing
// - Environment variable overrides (HIDUMPER_ prefix)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the dumper
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumperConfig {
    /// Engine behaviour
    #[serde(default)]
    pub engine: EngineSettings,

    /// Data source catalogue location
    #[serde(default)]
    pub catalogue: CatalogueConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DumperConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("HIDUMPER_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.default_timeout_secs < MIN_TIMEOUT_SECS {
            return Err(ConfigError::invalid_value(
                "engine.default_timeout_secs",
                format!("Timeout must be at least {}s", MIN_TIMEOUT_SECS),
            ));
        }

        if self.engine.default_row_limit == 0 {
            return Err(ConfigError::invalid_value(
                "engine.default_row_limit",
                "Limit must be at least 1",
            ));
        }

        if self.engine.zip_buffer_size < MIN_ZIP_BUFFER_SIZE {
            return Err(ConfigError::invalid_value(
                "engine.zip_buffer_size",
                format!("Buffer must be at least {} bytes", MIN_ZIP_BUFFER_SIZE),
            ));
        }

        if self.engine.list_names_per_row == 0 {
            return Err(ConfigError::invalid_value(
                "engine.list_names_per_row",
                "At least one name per row is required",
            ));
        }

        if !(1..=22).contains(&self.engine.zstd_level) {
            return Err(ConfigError::invalid_value(
                "engine.zstd_level",
                "Level must be within 1..=22",
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Engine Settings
// ----------------------------------------------------------------------------

/// Knobs the executors and outputs read at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Timeout applied when the command line gives none
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Per-source row limit applied when the command line gives none
    #[serde(default = "default_row_limit")]
    pub default_row_limit: u64,

    /// Compressed output source buffer size in bytes
    #[serde(default = "default_zip_buffer_size")]
    pub zip_buffer_size: usize,

    /// zstd level of the compressed output
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,

    /// List output column width
    #[serde(default = "default_list_name_width")]
    pub list_name_width: usize,

    /// List output names per row
    #[serde(default = "default_list_names_per_row")]
    pub list_names_per_row: usize,

    /// Smallest uid a stack dump may target
    #[serde(default = "default_stack_min_uid")]
    pub stack_min_uid: u32,

    /// Per-node duration above which a warning is logged
    #[serde(default = "default_slow_node_ms")]
    pub slow_node_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            default_row_limit: default_row_limit(),
            zip_buffer_size: default_zip_buffer_size(),
            zstd_level: default_zstd_level(),
            list_name_width: default_list_name_width(),
            list_names_per_row: default_list_names_per_row(),
            stack_min_uid: default_stack_min_uid(),
            slow_node_ms: default_slow_node_ms(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_row_limit() -> u64 {
    DEFAULT_ROW_LIMIT
}

fn default_zip_buffer_size() -> usize {
    DEFAULT_ZIP_BUFFER_SIZE
}

fn default_zstd_level() -> i32 {
    DEFAULT_ZSTD_LEVEL
}

fn default_list_name_width() -> usize {
    DEFAULT_LIST_NAME_WIDTH
}

fn default_list_names_per_row() -> usize {
    DEFAULT_LIST_NAMES_PER_ROW
}

fn default_stack_min_uid() -> u32 {
    DEFAULT_STACK_MIN_UID
}

fn default_slow_node_ms() -> u64 {
    DEFAULT_SLOW_NODE_MS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Catalogue Configuration
// ----------------------------------------------------------------------------

/// Where the declarative data source catalogue comes from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogueConfig {
    /// External catalogue TOML; the built-in table is used when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging on stderr so it never interleaves with dump output on
// stdout. Level comes from configuration and can be overridden by RUST_LOG.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> DumperResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        "off" => tracing::level_filters::LevelFilter::OFF,
        _ => tracing::level_filters::LevelFilter::WARN,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| DumperError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| DumperError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| DumperError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    debug!(
        target: "hidumper::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timer
// ----------------------------------------------------------------------------

/// Measures one executor phase and warns when it runs long.
#[derive(Debug)]
pub struct PerfTimer {
    name: String,
    start: Instant,
    threshold_ms: u64,
}

impl PerfTimer {
    pub fn with_threshold(name: impl Into<String>, threshold_ms: u64) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
            threshold_ms,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        if elapsed > self.threshold_ms {
            warn!(
                target: "hidumper::perf",
                node = %self.name,
                elapsed_ms = elapsed,
                threshold_ms = self.threshold_ms,
                "Node exceeded threshold"
            );
        } else {
            trace!(
                target: "hidumper::perf",
                node = %self.name,
                elapsed_ms = elapsed,
                "Node completed"
            );
        }
        elapsed
    }
}

// ============================================================================
// SECTION 7: REQUEST CONTEXT
// ============================================================================
// Everything a single dump request carries:
// - Resolved options (which categories, timeout, limit, output path)
// - The callback used for cancellation, progress and the output fd
// - The system-ability registry collaborator
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Request Options
// ----------------------------------------------------------------------------

/// Resolved command line selection for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumperOpts {
    pub is_dump_cpu_freq: bool,
    pub is_dump_cpu_usage: bool,
    pub cpu_usage_pid: i32,
    pub is_dump_log: bool,
    pub log_args: Vec<String>,
    pub is_dump_mem: bool,
    pub mem_pid: i32,
    pub is_dump_storage: bool,
    pub is_dump_net: bool,
    pub is_dump_processes: bool,
    pub process_pid: i32,
    pub is_dump_service: bool,
    pub service_names: Vec<String>,
    pub is_dump_system_ability: bool,
    pub ability_names: Vec<String>,
    pub ability_args: Vec<String>,
    pub is_dump_system: bool,
    pub system_args: Vec<String>,
    pub is_fault_log: bool,
    pub is_test: bool,
    pub is_show_list: bool,
    pub timeout_secs: u64,
    pub limit: u64,
    /// Empty for direct output, absolute for compressed output
    pub path: String,
}

impl Default for DumperOpts {
    fn default() -> Self {
        Self {
            is_dump_cpu_freq: false,
            is_dump_cpu_usage: false,
            cpu_usage_pid: INVALID_ID,
            is_dump_log: false,
            log_args: Vec::new(),
            is_dump_mem: false,
            mem_pid: INVALID_ID,
            is_dump_storage: false,
            is_dump_net: false,
            is_dump_processes: false,
            process_pid: INVALID_ID,
            is_dump_service: false,
            service_names: Vec::new(),
            is_dump_system_ability: false,
            ability_names: Vec::new(),
            ability_args: Vec::new(),
            is_dump_system: false,
            system_args: Vec::new(),
            is_fault_log: false,
            is_test: false,
            is_show_list: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            limit: DEFAULT_ROW_LIMIT,
            path: String::new(),
        }
    }
}

impl DumperOpts {
    /// Check the option rules.
    pub fn validate(&self) -> Result<(), OptionsError> {
        for (field, value) in [
            ("cpu_usage_pid", self.cpu_usage_pid),
            ("mem_pid", self.mem_pid),
            ("process_pid", self.process_pid),
        ] {
            if value < INVALID_ID {
                return Err(OptionsError::InvalidPid { field, value });
            }
        }

        if self.is_show_list
            && !(self.is_dump_service || self.is_dump_system_ability || self.is_dump_system)
        {
            return Err(OptionsError::ListWithoutTarget);
        }

        if !self.path.is_empty() && !Path::new(&self.path).is_absolute() {
            return Err(OptionsError::RelativePath {
                path: self.path.clone(),
            });
        }

        if self.timeout_secs < MIN_TIMEOUT_SECS {
            return Err(OptionsError::InvalidTimeout {
                min: MIN_TIMEOUT_SECS,
                value: self.timeout_secs,
            });
        }

        if self.limit < 1 {
            return Err(OptionsError::InvalidLimit);
        }

        Ok(())
    }

    /// Whether any collection category is selected.
    pub fn is_select_any(&self) -> bool {
        self.is_dump_cpu_freq
            || self.is_dump_cpu_usage
            || self.is_dump_log
            || self.is_dump_mem
            || self.is_dump_storage
            || self.is_dump_net
            || self.is_dump_processes
            || self.is_dump_service
            || self.is_dump_system_ability
            || self.is_dump_system
            || self.is_fault_log
            || self.is_test
    }

    /// Compressed output is used when a path is given.
    pub fn is_zip_output(&self) -> bool {
        !self.path.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 7.2 Request Callback
// ----------------------------------------------------------------------------

/// Hooks the request owner exposes to the engine.
pub trait RequestCallback: Send + Sync {
    /// Whether the caller asked to stop.
    fn is_canceled(&self) -> bool;

    /// Report progress of the current pass.
    fn update_progress(&self, total: usize, current: usize);

    /// Destination of outputs; `None` means stdout.
    fn output_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Help and error text for the user.
    fn write_help(&self, text: &str);
}

/// Process-level callback: cancel flag, progress counters and the output file.
#[derive(Debug, Default)]
pub struct RawParam {
    canceled: AtomicBool,
    progress_total: AtomicUsize,
    progress_current: AtomicUsize,
    output: Option<File>,
}

impl RawParam {
    /// Direct output to stdout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Output into `path`, created (or truncated) now.
    pub fn with_output_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            output: Some(file),
            ..Self::default()
        })
    }

    pub fn cancel(&self) {
        self.canceled.store(true, AtomicOrdering::Release);
    }

    pub fn progress(&self) -> (usize, usize) {
        (
            self.progress_total.load(AtomicOrdering::Acquire),
            self.progress_current.load(AtomicOrdering::Acquire),
        )
    }
}

impl RequestCallback for RawParam {
    fn is_canceled(&self) -> bool {
        self.canceled.load(AtomicOrdering::Acquire)
    }

    fn update_progress(&self, total: usize, current: usize) {
        self.progress_total.store(total, AtomicOrdering::Release);
        self.progress_current.store(current, AtomicOrdering::Release);
        trace!(target: "hidumper::progress", total, current, "Progress");
    }

    fn output_fd(&self) -> Option<BorrowedFd<'_>> {
        self.output.as_ref().map(|file| file.as_fd())
    }

    fn write_help(&self, text: &str) {
        eprintln!("{}", text);
    }
}

// ----------------------------------------------------------------------------
// 7.3 System Ability Registry
// ----------------------------------------------------------------------------

/// Remote abilities that can dump themselves into a file descriptor.
pub trait AbilityRegistry: Send + Sync {
    /// Names of every registered ability.
    fn list_abilities(&self) -> Vec<String>;

    /// Numeric id of an ability, by name or decimal id.
    fn resolve(&self, name: &str) -> Option<i32>;

    /// Synchronously dump ability `id` into `fd`.
    fn dump(&self, id: i32, fd: BorrowedFd<'_>, args: &[String]) -> Result<(), AbilityError>;
}

/// Handler of an in-process ability.
pub type AbilityHandler = Box<dyn Fn(&mut dyn Write, &[String]) -> io::Result<()> + Send + Sync>;

/// In-process registry of named abilities.
#[derive(Default)]
pub struct LocalAbilityRegistry {
    abilities: RwLock<BTreeMap<i32, (String, Arc<AbilityHandler>)>>,
}

impl fmt::Debug for LocalAbilityRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAbilityRegistry")
            .field("abilities", &self.list_abilities())
            .finish()
    }
}

impl LocalAbilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tool's own abilities.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(1, "HiDumperService", |out, args| {
            writeln!(out, "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION)?;
            writeln!(out, "pid: {}", std::process::id())?;
            if !args.is_empty() {
                writeln!(out, "args: {}", args.join(" "))?;
            }
            Ok(())
        });
        registry.register(2, "ProcessInfo", |out, _args| {
            let status = fs::read_to_string("/proc/self/status")?;
            for line in status.lines() {
                writeln!(out, "{}", line)?;
            }
            Ok(())
        });
        registry
    }

    pub fn register<F>(&self, id: i32, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut dyn Write, &[String]) -> io::Result<()> + Send + Sync + 'static,
    {
        let handler: AbilityHandler = Box::new(handler);
        self.abilities
            .write()
            .insert(id, (name.into(), Arc::new(handler)));
    }
}

impl AbilityRegistry for LocalAbilityRegistry {
    fn list_abilities(&self) -> Vec<String> {
        self.abilities
            .read()
            .values()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn resolve(&self, name: &str) -> Option<i32> {
        let abilities = self.abilities.read();
        if let Ok(id) = name.parse::<i32>() {
            return abilities.contains_key(&id).then_some(id);
        }
        abilities
            .iter()
            .find(|(_, (n, _))| n == name)
            .map(|(id, _)| *id)
    }

    fn dump(&self, id: i32, fd: BorrowedFd<'_>, args: &[String]) -> Result<(), AbilityError> {
        let handler = self
            .abilities
            .read()
            .get(&id)
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| AbilityError::NotFound {
                name: id.to_string(),
            })?;

        let owned = fd.try_clone_to_owned().map_err(|e| AbilityError::DumpFailed {
            id,
            message: e.to_string(),
        })?;
        let mut out = File::from(owned);
        handler(&mut out, args).map_err(|e| AbilityError::DumpFailed {
            id,
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 7.4 Request Context
// ----------------------------------------------------------------------------

/// Immutable-per-request parameter bag handed to every executor phase.
#[derive(Clone)]
pub struct RequestContext {
    pub opts: DumperOpts,
    pub settings: EngineSettings,
    /// Budget of one independent timeout window
    pub timeout: Duration,
    pub caller_uid: u32,
    pub caller_pid: u32,
    pub callback: Arc<dyn RequestCallback>,
    pub registry: Arc<dyn AbilityRegistry>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("opts", &self.opts)
            .field("timeout", &self.timeout)
            .field("caller_uid", &self.caller_uid)
            .field("caller_pid", &self.caller_pid)
            .finish()
    }
}

impl RequestContext {
    pub fn new(
        opts: DumperOpts,
        settings: EngineSettings,
        callback: Arc<dyn RequestCallback>,
        registry: Arc<dyn AbilityRegistry>,
    ) -> Self {
        // SAFETY: getuid(2) has no preconditions and cannot fail.
        let caller_uid = unsafe { libc::getuid() };
        Self {
            timeout: Duration::from_secs(opts.timeout_secs),
            opts,
            settings,
            caller_uid,
            caller_pid: std::process::id(),
            callback,
            registry,
        }
    }

    /// Override the timeout window.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.callback.is_canceled()
    }

    pub fn output_path(&self) -> &str {
        &self.opts.path
    }
}

// ============================================================================
// SECTION 8: EXECUTOR CONTRACT
// ============================================================================
// Every plan node is driven through PreExecute → Execute → AfterExecute.
// The handle wrapping an executor owns the per-request bookkeeping:
// - one-shot activation timestamp and resolved time budget
// - one-shot timeout flag turning later phases into no-ops
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Deadline
// ----------------------------------------------------------------------------

/// Time budget of an activated node.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    activated_at: Instant,
    /// Remaining budget at activation, in milliseconds (may be negative)
    remain_ms: i64,
}

impl Deadline {
    pub fn new(activated_at: Instant, remain_ms: i64) -> Self {
        Self {
            activated_at,
            remain_ms,
        }
    }

    /// Budget for stages that are never timed (outputs, filters).
    pub fn unbounded() -> Self {
        Self::new(Instant::now(), i64::MAX)
    }

    /// Budget derived from a window opened at `root_tick`.
    pub fn from_root(root_tick: Instant, activated_at: Instant, timeout: Duration) -> Self {
        let elapsed = activated_at.saturating_duration_since(root_tick).as_millis() as i64;
        Self::new(activated_at, timeout.as_millis() as i64 - elapsed)
    }

    pub fn remain_ms(&self) -> i64 {
        self.remain_ms
    }

    pub fn is_expired(&self) -> bool {
        self.remain_ms <= 0 || self.activated_at.elapsed().as_millis() as i64 >= self.remain_ms
    }
}

// ----------------------------------------------------------------------------
// 8.2 Executor Trait
// ----------------------------------------------------------------------------

/// Borrowed view an executor gets during each phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub node: &'a DumpConfig,
    pub request: &'a RequestContext,
    pub sink: &'a DumpSink,
    pub deadline: Deadline,
}

impl PhaseContext<'_> {
    pub fn is_canceled(&self) -> bool {
        self.request.is_canceled()
    }
}

/// Three-phase lifecycle shared by every executor.
pub trait Executor: Send {
    /// Short type name for logs.
    fn name(&self) -> &'static str;

    fn pre_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus;

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus;

    fn after_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus;

    /// Drop all per-request state so the instance could serve another request.
    fn reset(&mut self);
}

// ----------------------------------------------------------------------------
// 8.3 Executor Handle - Timeout & Cancellation Wrapper
// ----------------------------------------------------------------------------

/// An executor bound to a node, plus the wrapper state around its phases.
pub struct ExecutorHandle {
    node: NodeId,
    inner: Box<dyn Executor>,
    activated_at: Option<Instant>,
    deadline: Deadline,
    timed_out: bool,
}

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("node", &self.node)
            .field("executor", &self.inner.name())
            .field("activated_at", &self.activated_at)
            .field("deadline", &self.deadline)
            .field("timed_out", &self.timed_out)
            .finish()
    }
}

impl ExecutorHandle {
    pub fn new(node: NodeId, inner: Box<dyn Executor>) -> Self {
        Self {
            node,
            inner,
            activated_at: None,
            deadline: Deadline::unbounded(),
            timed_out: false,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn activated_at(&self) -> Option<Instant> {
        self.activated_at
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// `root_tick` is the start of the timeout window this node belongs to;
    /// `None` means the node opens its own window.
    pub fn do_pre_execute(
        &mut self,
        node: &DumpConfig,
        request: &RequestContext,
        sink: &DumpSink,
        root_tick: Option<Instant>,
    ) -> DumpStatus {
        if self.timed_out {
            return DumpStatus::Ok;
        }

        let timed = !(node.is_output() || node.is_filter());
        if timed && self.activated_at.is_none() {
            let now = Instant::now();
            self.activated_at = Some(now);
            self.deadline = Deadline::from_root(root_tick.unwrap_or(now), now, request.timeout);

            if self.deadline.remain_ms() <= 0 {
                warn!(
                    target: "hidumper::executor",
                    node = %node.name,
                    remain_ms = self.deadline.remain_ms(),
                    "Deadline passed before activation"
                );
                sink.push_line(TIME_OUT_STR);
                self.timed_out = true;
                return DumpStatus::Ok;
            }
        }

        let cx = self.context(node, request, sink);
        self.inner.pre_execute(&cx)
    }

    pub fn do_execute(&mut self, node: &DumpConfig, request: &RequestContext, sink: &DumpSink) -> DumpStatus {
        if self.timed_out {
            return DumpStatus::Ok;
        }
        let cx = self.context(node, request, sink);
        self.inner.execute(&cx)
    }

    pub fn do_after_execute(&mut self, node: &DumpConfig, request: &RequestContext, sink: &DumpSink) -> DumpStatus {
        if self.timed_out {
            return DumpStatus::Ok;
        }
        let cx = self.context(node, request, sink);
        self.inner.after_execute(&cx)
    }

    pub fn reset(&mut self) {
        self.activated_at = None;
        self.deadline = Deadline::unbounded();
        self.timed_out = false;
        self.inner.reset();
    }

    fn context<'a>(
        &self,
        node: &'a DumpConfig,
        request: &'a RequestContext,
        sink: &'a DumpSink,
    ) -> PhaseContext<'a> {
        PhaseContext {
            node,
            request,
            sink,
            deadline: self.deadline,
        }
    }
}

// ----------------------------------------------------------------------------
// 8.4 Paging Helpers
// ----------------------------------------------------------------------------

/// Line-at-a-time reader shared by the command and file executors.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    emitted: u64,
    limit: u64,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::with_capacity(256),
            emitted: 0,
            limit,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Read one line into the sink. `Ok` at end of input (or once the row
    /// limit is reached), `MoreData` when input remains, `Fail` on error.
    pub fn read_line(&mut self, sink: &DumpSink) -> DumpStatus {
        if self.emitted >= self.limit {
            return DumpStatus::Ok;
        }

        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => return DumpStatus::Ok,
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                }
                sink.push_line(String::from_utf8_lossy(&self.buf).into_owned());
                self.emitted += 1;
            }
            Err(e) => {
                debug!(target: "hidumper::executor", error = %e, "Line read failed");
                return DumpStatus::Fail;
            }
        }

        if self.emitted >= self.limit {
            return DumpStatus::Ok;
        }

        match self.reader.fill_buf() {
            Ok(rest) if rest.is_empty() => DumpStatus::Ok,
            Ok(_) => DumpStatus::MoreData,
            Err(_) => DumpStatus::Fail,
        }
    }
}

/// Run `step` once in loop mode, or until it stops returning `MoreData` (or
/// the request is canceled) otherwise.
pub fn page_or_drain(cx: &PhaseContext<'_>, mut step: impl FnMut() -> DumpStatus) -> DumpStatus {
    if cx.node.can_loop() {
        return step();
    }
    loop {
        if cx.is_canceled() {
            debug!(target: "hidumper::executor", node = %cx.node.name, "Canceled while draining");
            return DumpStatus::MoreData;
        }
        let status = step();
        if status != DumpStatus::MoreData {
            return status;
        }
    }
}

/// Shared AfterExecute policy of paginated executors: returns the status and
/// whether the underlying handle should now be closed.
pub fn finish_page(cx: &PhaseContext<'_>, more: bool) -> (DumpStatus, bool) {
    if more && cx.deadline.is_expired() {
        warn!(
            target: "hidumper::executor",
            node = %cx.node.name,
            "Deadline exceeded with data pending"
        );
        cx.sink.push_line(TIME_OUT_STR);
        return (DumpStatus::Ok, true);
    }
    if !more {
        return (DumpStatus::Ok, true);
    }
    (DumpStatus::MoreData, false)
}

// ============================================================================
// SECTION 9: COMMAND EXECUTOR
// ============================================================================
// Runs a shell command template and streams its stdout line by line.
// Loop mode reads one line per dispatch pass; otherwise the output is drained
// in one go with cancellation checked between lines.
// ============================================================================

/// Streams the stdout of a shell command.
#[derive(Debug, Default)]
pub struct CmdExecutor {
    command: String,
    child: Option<Child>,
    reader: Option<LineReader<ChildStdout>>,
    spawned: bool,
    last_status: Option<DumpStatus>,
}

impl CmdExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(command: &str) -> ExecutorResult<(Child, ChildStdout)> {
        let mut child = ProcessCommand::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecutorError::SpawnFailed {
                command: command.to_string(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| ExecutorError::SpawnFailed {
            command: command.to_string(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"),
        })?;
        Ok((child, stdout))
    }

    /// Drain a one-off command fully into `sink`, blocking until it exits.
    pub fn run_and_collect(command: &str, sink: &DumpSink) -> DumpStatus {
        let (mut child, stdout) = match Self::spawn(command) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(target: "hidumper::cmd", error = %e, "Command not started");
                return DumpStatus::Fail;
            }
        };
        let mut reader = LineReader::new(stdout, u64::MAX);
        let mut status = DumpStatus::MoreData;
        while status == DumpStatus::MoreData {
            status = reader.read_line(sink);
        }
        drop(reader);
        if let Err(e) = child.wait() {
            debug!(target: "hidumper::cmd", error = %e, "Wait failed");
        }
        status
    }

    /// Close the pipe and reap the child, killing it if still running.
    fn close(&mut self) {
        self.reader = None;
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
            match child.wait() {
                Ok(exit) => trace!(target: "hidumper::cmd", command = %self.command, %exit, "Command closed"),
                Err(e) => debug!(target: "hidumper::cmd", error = %e, "Wait failed"),
            }
        }
    }
}

impl Drop for CmdExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Stack dumps are only allowed for ordinary user processes: not init, not a
/// kernel thread (empty cmdline), and owned by a non-privileged uid.
pub fn is_user_process(pid: i32, uid: Option<i32>, min_uid: u32) -> bool {
    if pid <= 1 {
        return false;
    }

    let proc_dir = PathBuf::from(format!("/proc/{}", pid));
    match fs::read(proc_dir.join("cmdline")) {
        Ok(cmdline) if !cmdline.is_empty() => {}
        _ => return false,
    }

    let uid = match uid {
        Some(uid) => uid as i64,
        None => match read_status_uid(&proc_dir) {
            Some(uid) => uid as i64,
            None => return false,
        },
    };
    uid >= min_uid as i64
}

fn read_status_uid(proc_dir: &Path) -> Option<u32> {
    let status = fs::read_to_string(proc_dir.join("status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

impl Executor for CmdExecutor {
    fn name(&self) -> &'static str {
        "cmd"
    }

    fn pre_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        if self.spawned {
            return DumpStatus::Ok;
        }

        let args = cx.node.args.as_ref();
        let command = substitute_placeholders(&cx.node.target, args);

        if cx.node.name == STACK_DUMP_SOURCE {
            let pid = args.and_then(DumpArgs::pid).unwrap_or(INVALID_ID);
            let uid = args.and_then(DumpArgs::uid);
            if !is_user_process(pid, uid, cx.request.settings.stack_min_uid) {
                let e = ExecutorError::NotUserProcess { pid };
                warn!(target: "hidumper::cmd", node = %cx.node.name, error = %e, "Policy denied");
                return DumpStatus::Fail;
            }
        }

        match Self::spawn(&command) {
            Ok((child, stdout)) => {
                debug!(target: "hidumper::cmd", command = %command, pid = child.id(), "Command started");
                self.child = Some(child);
                self.reader = Some(LineReader::new(stdout, cx.request.opts.limit));
                self.spawned = true;
                cx.sink.push_line(format!("{}{}", CMD_PREFIX, command));
                self.command = command;
                DumpStatus::Ok
            }
            Err(e) => {
                warn!(target: "hidumper::cmd", node = %cx.node.name, error = %e, "Command not started");
                DumpStatus::Fail
            }
        }
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let Some(reader) = self.reader.as_mut() else {
            self.last_status = Some(DumpStatus::Ok);
            return DumpStatus::Ok;
        };
        let status = page_or_drain(cx, || reader.read_line(cx.sink));
        self.last_status = Some(status);
        status
    }

    fn after_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let more = self.reader.is_some() && self.last_status == Some(DumpStatus::MoreData);
        let (status, close) = finish_page(cx, more);
        if close {
            self.close();
        }
        status
    }

    fn reset(&mut self) {
        self.close();
        self.command.clear();
        self.spawned = false;
        self.last_status = None;
    }
}

// ============================================================================
// SECTION 10: FILE EXECUTOR
// ============================================================================
// Streams one file, or every entry of a directory, line by line. Each opened
// file is introduced by a blank / filename / blank header block.
// ============================================================================

/// Streams files and directory contents.
#[derive(Debug, Default)]
pub struct FileExecutor {
    queue: Vec<PathBuf>,
    next: usize,
    current: Option<LineReader<File>>,
    prepared: bool,
    last_status: Option<DumpStatus>,
}

impl FileExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered list of files a target expands to.
    pub fn resolve_targets(target: &str, args: Option<&DumpArgs>) -> Vec<PathBuf> {
        let path = PathBuf::from(substitute_placeholders(target, args));
        if !path.is_dir() {
            return vec![path];
        }

        let mut entries: Vec<PathBuf> = match fs::read_dir(&path) {
            Ok(dir) => dir
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| name != "." && name != "..")
                .map(|name| path.join(name))
                .filter(|entry| !entry.is_dir())
                .collect(),
            Err(e) => {
                debug!(target: "hidumper::file", path = %path.display(), error = %e, "Directory not readable");
                Vec::new()
            }
        };
        entries.sort();
        entries
    }

    /// Open the next queued file and emit its header block.
    fn open_next(&mut self, cx: &PhaseContext<'_>) -> ExecutorResult<()> {
        let path = self.queue.get(self.next).cloned().ok_or_else(|| ExecutorError::NothingToRead {
            target: cx.node.target.clone(),
        })?;
        self.next += 1;

        let file = File::open(&path).map_err(|source| ExecutorError::OpenFailed {
            path: path.clone(),
            source,
        })?;
        cx.sink.push_blank();
        cx.sink.push_line(path.to_string_lossy().into_owned());
        cx.sink.push_blank();
        self.current = Some(LineReader::new(file, cx.request.opts.limit));
        Ok(())
    }

    /// One read step across the file queue.
    fn step(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let Some(reader) = self.current.as_mut() else {
            return DumpStatus::Ok;
        };
        match reader.read_line(cx.sink) {
            DumpStatus::Ok => self.on_eof(cx),
            other => other,
        }
    }

    fn on_eof(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        self.current = None;
        if self.next >= self.queue.len() {
            return DumpStatus::Ok;
        }
        match self.open_next(cx) {
            Ok(()) => DumpStatus::MoreData,
            Err(e) => {
                warn!(target: "hidumper::file", node = %cx.node.name, error = %e, "Next file not opened");
                DumpStatus::Fail
            }
        }
    }
}

impl Executor for FileExecutor {
    fn name(&self) -> &'static str {
        "file"
    }

    fn pre_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        if self.prepared {
            return DumpStatus::Ok;
        }
        self.prepared = true;
        self.queue = Self::resolve_targets(&cx.node.target, cx.node.args.as_ref());
        self.next = 0;

        match self.open_next(cx) {
            Ok(()) => DumpStatus::Ok,
            Err(e) => {
                debug!(target: "hidumper::file", node = %cx.node.name, error = %e, "Nothing opened");
                DumpStatus::Fail
            }
        }
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let status = page_or_drain(cx, || self.step(cx));
        self.last_status = Some(status);
        status
    }

    fn after_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let more = self.current.is_some() && self.last_status == Some(DumpStatus::MoreData);
        let (status, close) = finish_page(cx, more);
        if close {
            self.current = None;
            self.next = self.queue.len();
        }
        status
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.next = 0;
        self.current = None;
        self.prepared = false;
        self.last_status = None;
    }
}

// ============================================================================
// SECTION 11: SYSTEM ABILITY EXECUTOR
// ============================================================================
// Each ability dumps itself into the write end of an OS pipe on a scoped
// thread while a second scoped thread forwards the read end line by line over
// a bounded channel. The dispatch thread drains that channel into the sink as
// lines arrive, so at most READER_CHANNEL_CAPACITY lines are buffered. Both
// threads are joined before the executor returns.
// ============================================================================

/// Lines in flight between the pipe reader and the sink.
const READER_CHANNEL_CAPACITY: usize = 256;

/// Create a close-on-exec pipe, returning `(read_end, write_end)`.
pub fn open_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe2 to fill.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded; both descriptors are fresh and owned here.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok(pair)
}

fn spawn_pipe_reader<'scope>(
    scope: &'scope thread::Scope<'scope, '_>,
    read_end: OwnedFd,
    tx: CrossbeamSender<String>,
    label: String,
) -> io::Result<thread::ScopedJoinHandle<'scope, ()>> {
    thread::Builder::new().name(label).spawn_scoped(scope, move || {
        let mut reader = BufReader::new(File::from(read_end));
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(target: "hidumper::ability", error = %e, "Pipe read failed");
                    break;
                }
            }
        }
    })
}

/// Dumps registered system abilities through a pipe.
#[derive(Debug, Default)]
pub struct SaExecutor {
    names: Vec<String>,
    next: usize,
    prepared: bool,
}

impl SaExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dump one ability into the sink.
    fn dump_one(cx: &PhaseContext<'_>, name: &str) -> DumperResult<usize> {
        let registry = &cx.request.registry;
        let id = registry.resolve(name).ok_or_else(|| AbilityError::NotFound {
            name: name.to_string(),
        })?;

        cx.sink
            .push_line(format!("{}[{}]{}", ABILITY_SEPARATOR, name, ABILITY_SEPARATOR));

        let (read_end, write_end) = open_pipe().map_err(ExecutorError::Pipe)?;
        let (tx, rx) = bounded::<String>(READER_CHANNEL_CAPACITY);
        let args = cx.node.args.as_ref().map(DumpArgs::forwarded_args).unwrap_or(&[]);
        let limit = cx.request.opts.limit;

        let (dumped, lines) = thread::scope(|scope| -> DumperResult<_> {
            let reader = spawn_pipe_reader(scope, read_end, tx, format!("sa-reader-{}", id))
                .map_err(ExecutorError::Pipe)?;
            let writer = thread::Builder::new()
                .name(format!("sa-dump-{}", id))
                .spawn_scoped(scope, move || {
                    let dumped = registry.dump(id, write_end.as_fd(), args);
                    drop(write_end);
                    dumped
                })
                .map_err(ExecutorError::Pipe)?;

            // Lines past the limit are still read so the writer never stalls.
            let mut lines = 0u64;
            for line in rx.iter() {
                if lines < limit {
                    cx.sink.push_line(line);
                    lines += 1;
                }
            }

            let dumped = writer.join().map_err(|_| ExecutorError::ReaderThread {
                message: format!("dump of ability {} panicked", id),
            })?;
            reader.join().map_err(|_| ExecutorError::ReaderThread {
                message: format!("reader for ability {} panicked", id),
            })?;
            Ok((dumped, lines))
        })?;

        dumped?;
        Ok(usize::try_from(lines).unwrap_or(usize::MAX))
    }

    fn step(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let Some(name) = self.names.get(self.next).cloned() else {
            return DumpStatus::Ok;
        };
        self.next += 1;

        match Self::dump_one(cx, &name) {
            Ok(lines) => {
                debug!(target: "hidumper::ability", ability = %name, lines, "Ability dumped");
            }
            Err(e) => {
                warn!(
                    target: "hidumper::ability",
                    ability = %name,
                    category = e.category(),
                    error = %e,
                    "Ability dump failed, continuing"
                );
            }
        }

        if self.next < self.names.len() {
            DumpStatus::MoreData
        } else {
            DumpStatus::Ok
        }
    }
}

impl Executor for SaExecutor {
    fn name(&self) -> &'static str {
        "ability"
    }

    fn pre_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        if self.prepared {
            return DumpStatus::Ok;
        }
        self.prepared = true;

        let named = cx.node.args.as_ref().map(DumpArgs::names).unwrap_or(&[]);
        self.names = if named.is_empty() {
            cx.request.registry.list_abilities()
        } else {
            named.to_vec()
        };
        self.next = 0;
        trace!(target: "hidumper::ability", count = self.names.len(), "Abilities queued");
        DumpStatus::Ok
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        page_or_drain(cx, || self.step(cx))
    }

    fn after_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let more = self.next < self.names.len();
        let (status, close) = finish_page(cx, more);
        if close {
            self.next = self.names.len();
        }
        status
    }

    fn reset(&mut self) {
        self.names.clear();
        self.next = 0;
        self.prepared = false;
    }
}

// ============================================================================
// SECTION 12: INFO EXECUTORS (LIST / API / VERSION / GROUP)
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 List
// ----------------------------------------------------------------------------

/// Lays registered names out in fixed-width columns.
#[derive(Debug)]
pub struct ListExecutor {
    kind: ListKind,
}

impl ListExecutor {
    pub fn new(kind: ListKind) -> Self {
        Self { kind }
    }

    pub fn header(kind: ListKind) -> &'static str {
        match kind {
            ListKind::Service => "Service list:",
            ListKind::Ability => "System ability list:",
            ListKind::System => "System cluster list:",
        }
    }

    /// Pad every name to `width` and group `per_row` names per row.
    pub fn layout(names: &[String], width: usize, per_row: usize) -> Vec<Row> {
        names
            .chunks(per_row.max(1))
            .map(|chunk| chunk.iter().map(|name| format!("{:>width$}", name, width = width)).collect())
            .collect()
    }
}

impl Executor for ListExecutor {
    fn name(&self) -> &'static str {
        "list"
    }

    fn pre_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let named = cx.node.args.as_ref().map(DumpArgs::names).unwrap_or(&[]);
        // Services are system abilities hosted by a service process and are
        // dumped through the same registry, so the service and ability lists
        // name the same entries under different headers.
        let names = if named.is_empty() {
            cx.request.registry.list_abilities()
        } else {
            named.to_vec()
        };

        let settings = &cx.request.settings;
        cx.sink.push_line(Self::header(self.kind));
        for row in Self::layout(&names, settings.list_name_width, settings.list_names_per_row) {
            cx.sink.push_row(row);
        }
        DumpStatus::Ok
    }

    fn after_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn reset(&mut self) {}
}

// ----------------------------------------------------------------------------
// 12.2 Api
// ----------------------------------------------------------------------------

/// Platform and kernel properties as `Key: value` rows.
#[derive(Debug, Default)]
pub struct ApiExecutor;

impl ApiExecutor {
    fn os_release() -> Vec<(&'static str, String)> {
        let text = fs::read_to_string("/etc/os-release").unwrap_or_default();
        let lookup = |key: &str| {
            text.lines()
                .find_map(|line| line.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
                .map(|value| value.trim_matches('"').to_string())
        };
        vec![
            ("OsName", lookup("PRETTY_NAME").or_else(|| lookup("NAME")).unwrap_or_default()),
            ("OsVersion", lookup("VERSION_ID").unwrap_or_default()),
        ]
    }

    fn kernel() -> Vec<(&'static str, String)> {
        // SAFETY: utsname is plain old data; zeroed is a valid initial value.
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        // SAFETY: `uts` is a valid, writable utsname.
        if unsafe { libc::uname(&mut uts) } != 0 {
            debug!(target: "hidumper::api", error = %io::Error::last_os_error(), "uname failed");
            return Vec::new();
        }
        let field = |raw: &[libc::c_char]| {
            // SAFETY: uname NUL-terminates every field inside its fixed array.
            unsafe { CStr::from_ptr(raw.as_ptr()) }.to_string_lossy().into_owned()
        };
        vec![
            ("KernelName", field(&uts.sysname[..])),
            ("KernelRelease", field(&uts.release[..])),
            ("KernelVersion", field(&uts.version[..])),
            ("Machine", field(&uts.machine[..])),
            ("NodeName", field(&uts.nodename[..])),
        ]
    }

    fn boot_time() -> Option<String> {
        let stat = fs::read_to_string("/proc/stat").ok()?;
        let btime: i64 = stat
            .lines()
            .find_map(|line| line.strip_prefix("btime "))?
            .trim()
            .parse()
            .ok()?;
        let at = Local.timestamp_opt(btime, 0).single()?;
        Some(at.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

impl Executor for ApiExecutor {
    fn name(&self) -> &'static str {
        "api"
    }

    fn pre_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let mut pairs = Self::os_release();
        pairs.extend(Self::kernel());
        if let Some(boot) = Self::boot_time() {
            pairs.push(("BootTime", boot));
        }
        for (key, value) in pairs {
            cx.sink.push_line(format!("{}: {}", key, value));
        }
        DumpStatus::Ok
    }

    fn after_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn reset(&mut self) {}
}

// ----------------------------------------------------------------------------
// 12.3 Version & Group
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct VersionExecutor;

impl Executor for VersionExecutor {
    fn name(&self) -> &'static str {
        "version"
    }

    fn pre_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        cx.sink.push_line(format!("{} version:{}", ENGINE_NAME, ENGINE_VERSION));
        DumpStatus::Ok
    }

    fn after_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn reset(&mut self) {}
}

/// Structural subtree boundary; never produces rows.
#[derive(Debug, Default)]
pub struct GroupExecutor;

impl Executor for GroupExecutor {
    fn name(&self) -> &'static str {
        "group"
    }

    fn pre_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn after_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn reset(&mut self) {}
}

// ============================================================================
// SECTION 13: FILTERS
// ============================================================================

/// Strips trailing whitespace from cells appended since the previous pass.
#[derive(Debug, Default)]
pub struct TrimTrailingFilter {
    watermark: usize,
}

impl Executor for TrimTrailingFilter {
    fn name(&self) -> &'static str {
        "trim_trailing"
    }

    fn pre_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        self.watermark = cx.sink.update_since(self.watermark, |row| {
            for cell in row.iter_mut() {
                let kept = cell.trim_end().len();
                cell.truncate(kept);
            }
        });
        DumpStatus::Ok
    }

    fn after_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        DumpStatus::Ok
    }

    fn reset(&mut self) {
        self.watermark = 0;
    }
}

// ============================================================================
// SECTION 14: OUTPUT BACKENDS
// ============================================================================
// Terminal consumers of the row stream. Every output drains the sink, so rows
// are written exactly once even when the dispatch loop revisits the output
// after a rewind. A row renders as its cells concatenated plus a newline.
// ============================================================================

/// Bytes of one rendered row.
pub fn render_row(row: &Row) -> String {
    let mut line = row.concat();
    line.push('\n');
    line
}

fn write_rows(out: &mut dyn Write, rows: &[Row]) -> io::Result<()> {
    for row in rows {
        out.write_all(render_row(row).as_bytes())?;
    }
    out.flush()
}

/// Duplicate the request's output fd, if the caller provided one.
fn request_output(request: &RequestContext) -> io::Result<Option<File>> {
    request
        .callback
        .output_fd()
        .map(|fd| fd.try_clone_to_owned().map(File::from))
        .transpose()
}

// ----------------------------------------------------------------------------
// 14.1 Fd Output
// ----------------------------------------------------------------------------

/// Writes rows to the request fd, or stdout when there is none.
#[derive(Debug, Default)]
pub struct FdOutput {
    dest: Option<File>,
    rows_written: usize,
}

impl FdOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Executor for FdOutput {
    fn name(&self) -> &'static str {
        "fd_output"
    }

    fn pre_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        match request_output(cx.request) {
            Ok(dest) => {
                self.dest = dest;
                DumpStatus::Ok
            }
            Err(e) => {
                warn!(target: "hidumper::output", node = %cx.node.name, error = %e, "Output fd not usable");
                DumpStatus::Fail
            }
        }
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let rows = cx.sink.drain();
        let written = match self.dest.as_mut() {
            Some(file) => write_rows(file, &rows),
            None => write_rows(&mut io::stdout().lock(), &rows),
        };
        match written {
            Ok(()) => {
                self.rows_written += rows.len();
                DumpStatus::Ok
            }
            Err(source) => {
                let e = OutputError::WriteFailed {
                    name: cx.node.name.clone(),
                    source,
                };
                warn!(target: "hidumper::output", error = %e, "Rows lost");
                DumpStatus::Fail
            }
        }
    }

    fn after_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        self.dest = None;
        DumpStatus::Ok
    }

    fn reset(&mut self) {
        if self.rows_written > 0 {
            trace!(target: "hidumper::output", rows = self.rows_written, "Fd output done");
        }
        self.dest = None;
        self.rows_written = 0;
    }
}

// ----------------------------------------------------------------------------
// 14.2 File Output
// ----------------------------------------------------------------------------

/// Writes rows into the file named by the node target.
#[derive(Debug, Default)]
pub struct FileOutput {
    dest: Option<File>,
    created: bool,
}

impl FileOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&mut self, node: &DumpConfig) -> OutputResult<File> {
        if node.target.is_empty() {
            return Err(OutputError::NoDestination {
                name: node.name.clone(),
            });
        }
        let mut options = OpenOptions::new();
        if self.created {
            options.append(true);
        } else {
            options.create(true).write(true).truncate(true);
        }
        let file = options.open(&node.target).map_err(|source| OutputError::WriteFailed {
            name: node.name.clone(),
            source,
        })?;
        self.created = true;
        Ok(file)
    }
}

impl Executor for FileOutput {
    fn name(&self) -> &'static str {
        "file_output"
    }

    fn pre_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        match self.open(cx.node) {
            Ok(file) => {
                self.dest = Some(file);
                DumpStatus::Ok
            }
            Err(e) => {
                warn!(target: "hidumper::output", path = %cx.node.target, error = %e, "Output file not opened");
                DumpStatus::Fail
            }
        }
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let Some(file) = self.dest.as_mut() else {
            return DumpStatus::Fail;
        };
        match write_rows(file, &cx.sink.drain()) {
            Ok(()) => DumpStatus::Ok,
            Err(e) => {
                warn!(target: "hidumper::output", path = %cx.node.target, error = %e, "Rows lost");
                DumpStatus::Fail
            }
        }
    }

    fn after_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        self.dest = None;
        DumpStatus::Ok
    }

    fn reset(&mut self) {
        self.dest = None;
        self.created = false;
    }
}

// ----------------------------------------------------------------------------
// 14.3 Compression Engine
// ----------------------------------------------------------------------------

/// Block compressor behind the compressed output.
pub trait Compressor: Send {
    /// Compress `src` into one self-contained frame.
    fn compress(&mut self, src: &[u8]) -> OutputResult<Vec<u8>>;
}

/// zstd frames; concatenated frames decode as one stream.
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&mut self, src: &[u8]) -> OutputResult<Vec<u8>> {
        zstd::bulk::compress(src, self.level).map_err(|e| OutputError::CompressionFailed {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 14.4 Zip Output
// ----------------------------------------------------------------------------

/// Source accumulation buffer of the compressed output. Released bytes that
/// were never flushed are reported when the guard drops.
#[derive(Debug)]
pub struct ZipBuffers {
    src: Vec<u8>,
    capacity: usize,
    flushed_bytes: u64,
    frames: u64,
}

impl ZipBuffers {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            src: Vec::with_capacity(capacity),
            capacity,
            flushed_bytes: 0,
            frames: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.src.len()
    }

    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Append one piece, flushing first when it would overflow. Pieces larger
    /// than the whole buffer are compressed chunk by chunk.
    pub fn append(
        &mut self,
        piece: &[u8],
        compressor: &mut dyn Compressor,
        dest: &mut dyn Write,
    ) -> OutputResult<()> {
        if piece.len() > self.capacity {
            self.flush(compressor, dest)?;
            for chunk in piece.chunks(self.capacity) {
                self.write_frame(chunk, compressor, dest)?;
            }
            return Ok(());
        }
        if self.src.len() + piece.len() > self.capacity {
            self.flush(compressor, dest)?;
        }
        self.src.extend_from_slice(piece);
        Ok(())
    }

    /// Compress and write whatever is buffered.
    pub fn flush(&mut self, compressor: &mut dyn Compressor, dest: &mut dyn Write) -> OutputResult<()> {
        if self.src.is_empty() {
            return Ok(());
        }
        let src = std::mem::take(&mut self.src);
        let result = self.write_frame(&src, compressor, dest);
        self.src = src;
        self.src.clear();
        result
    }

    fn write_frame(
        &mut self,
        bytes: &[u8],
        compressor: &mut dyn Compressor,
        dest: &mut dyn Write,
    ) -> OutputResult<()> {
        let frame = compressor.compress(bytes)?;
        dest.write_all(&frame).map_err(|source| OutputError::WriteFailed {
            name: "zip".to_string(),
            source,
        })?;
        self.flushed_bytes += bytes.len() as u64;
        self.frames += 1;
        Ok(())
    }
}

impl Drop for ZipBuffers {
    fn drop(&mut self) {
        if !self.src.is_empty() {
            warn!(
                target: "hidumper::output",
                unflushed = self.src.len(),
                "Compressed output released with pending bytes"
            );
        }
        trace!(
            target: "hidumper::output",
            frames = self.frames,
            bytes = self.flushed_bytes,
            "Zip buffers released"
        );
    }
}

/// Compressed stream on the request fd.
pub struct ZipOutput {
    compressor: Box<dyn Compressor>,
    buffer_size: usize,
    buffers: Option<ZipBuffers>,
    dest: Option<File>,
}

impl fmt::Debug for ZipOutput {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipOutput")
            .field("buffer_size", &self.buffer_size)
            .field("buffers", &self.buffers)
            .finish()
    }
}

impl ZipOutput {
    pub fn new(buffer_size: usize, compressor: Box<dyn Compressor>) -> Self {
        Self {
            compressor,
            buffer_size,
            buffers: None,
            dest: None,
        }
    }

    fn write_rows(&mut self, rows: &[Row]) -> OutputResult<()> {
        let (Some(buffers), Some(dest)) = (self.buffers.as_mut(), self.dest.as_mut()) else {
            return Err(OutputError::NoDestination {
                name: "zip".to_string(),
            });
        };
        let compressor = self.compressor.as_mut();
        for row in rows {
            for cell in row {
                buffers.append(cell.as_bytes(), compressor, dest)?;
            }
            buffers.append(b"\n", compressor, dest)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> OutputResult<()> {
        if let (Some(buffers), Some(dest)) = (self.buffers.as_mut(), self.dest.as_mut()) {
            buffers.flush(self.compressor.as_mut(), dest)?;
            dest.flush().map_err(|source| OutputError::WriteFailed {
                name: "zip".to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.buffers = None;
        self.dest = None;
    }
}

impl Executor for ZipOutput {
    fn name(&self) -> &'static str {
        "zip_output"
    }

    fn pre_execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        let dest = match request_output(cx.request) {
            Ok(Some(dest)) => dest,
            Ok(None) => {
                let e = OutputError::NoDestination {
                    name: cx.node.name.clone(),
                };
                warn!(target: "hidumper::output", error = %e, "Compressed output skipped");
                return DumpStatus::Fail;
            }
            Err(e) => {
                warn!(target: "hidumper::output", error = %e, "Output fd not usable");
                return DumpStatus::Fail;
            }
        };
        self.dest = Some(dest);
        self.buffers = Some(ZipBuffers::new(self.buffer_size));
        DumpStatus::Ok
    }

    fn execute(&mut self, cx: &PhaseContext<'_>) -> DumpStatus {
        match self.write_rows(&cx.sink.drain()) {
            Ok(()) => DumpStatus::Ok,
            Err(e) => {
                warn!(target: "hidumper::output", error = %e, "Compressed write failed");
                self.release();
                DumpStatus::Fail
            }
        }
    }

    fn after_execute(&mut self, _cx: &PhaseContext<'_>) -> DumpStatus {
        let result = self.finish();
        self.release();
        match result {
            Ok(()) => DumpStatus::Ok,
            Err(e) => {
                warn!(target: "hidumper::output", error = %e, "Compressed flush failed");
                DumpStatus::Fail
            }
        }
    }

    fn reset(&mut self) {
        self.release();
    }
}

// ============================================================================
// SECTION 15: EXECUTOR FACTORY
// ============================================================================

/// Build the executor for a node from its kind.
pub fn create_executor(node: &DumpConfig, settings: &EngineSettings) -> Box<dyn Executor> {
    match node.kind {
        NodeKind::Dumper(DumperKind::Cmd) => Box::new(CmdExecutor::new()),
        NodeKind::Dumper(DumperKind::File) => Box::new(FileExecutor::new()),
        NodeKind::Dumper(DumperKind::Ability) => Box::new(SaExecutor::new()),
        NodeKind::Dumper(DumperKind::List(kind)) => Box::new(ListExecutor::new(kind)),
        NodeKind::Dumper(DumperKind::Api) => Box::new(ApiExecutor),
        NodeKind::Dumper(DumperKind::Version) => Box::new(VersionExecutor),
        NodeKind::Filter(FilterKind::TrimTrailing) => Box::new(TrimTrailingFilter::default()),
        NodeKind::Output(OutputKind::Fd) => Box::new(FdOutput::new()),
        NodeKind::Output(OutputKind::File) => Box::new(FileOutput::new()),
        NodeKind::Output(OutputKind::Zip) => Box::new(ZipOutput::new(
            settings.zip_buffer_size,
            Box::new(ZstdCompressor::new(settings.zstd_level)),
        )),
        NodeKind::Group => Box::new(GroupExecutor),
    }
}

// ============================================================================
// SECTION 16: DISPATCH ENGINE
// ============================================================================
// Walks the flattened plan once, driving every executor through its phases.
// Loopable nodes that report MoreData are pushed on a loop stack; reaching an
// output or group boundary rewinds to the most recently pushed index and
// clears the stack. Nodes pushed earlier in the same boundary are not retried.
// ============================================================================

/// Outcome counters of one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub nodes: usize,
    /// Node visits, rewinds included
    pub steps: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rewinds: usize,
    pub canceled: bool,
    pub elapsed: Duration,
}

/// Owns the plan, the request and one executor handle per plan node.
pub struct DumpEngine {
    plan: Plan,
    request: RequestContext,
    order: Vec<NodeId>,
    handles: Vec<ExecutorHandle>,
    /// Node to handle slot
    bindings: HashMap<NodeId, usize>,
}

impl fmt::Debug for DumpEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumpEngine")
            .field("nodes", &self.order.len())
            .field("request", &self.request)
            .finish()
    }
}

impl DumpEngine {
    pub fn new(plan: Plan, request: RequestContext) -> Self {
        Self::with_executors(plan, request, create_executor)
    }

    /// Build with a custom executor factory.
    pub fn with_executors<F>(plan: Plan, request: RequestContext, mut factory: F) -> Self
    where
        F: FnMut(&DumpConfig, &EngineSettings) -> Box<dyn Executor>,
    {
        let order = plan.flatten();
        let mut handles = Vec::with_capacity(order.len());
        let mut bindings = HashMap::with_capacity(order.len());
        for (slot, &id) in order.iter().enumerate() {
            let executor = factory(plan.node(id), &request.settings);
            handles.push(ExecutorHandle::new(id, executor));
            bindings.insert(id, slot);
        }
        debug!(target: "hidumper::dispatch", nodes = order.len(), "Executors bound");

        Self {
            plan,
            request,
            order,
            handles,
            bindings,
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    /// Executor order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Node whose activation opens the timeout window `id` runs in.
    pub fn root_owner(&self, id: NodeId) -> NodeId {
        let Some(parent) = self.plan.parent(id).filter(|p| self.bindings.contains_key(p)) else {
            return id;
        };
        let node = self.plan.node(id);
        if node.is_group() && matches!(node.nesting, NestingType::ByPid | NestingType::None) {
            return id;
        }
        self.root_owner(parent)
    }

    /// Activation tick of the window owner; `None` when `id` owns its window
    /// or the owner never activated.
    pub fn root_tick(&self, id: NodeId) -> Option<Instant> {
        let owner = self.root_owner(id);
        if owner == id {
            return None;
        }
        self.bindings
            .get(&owner)
            .and_then(|&slot| self.handles[slot].activated_at())
    }

    /// Push rows produced before a cancel through every filter and output
    /// stage once, in plan order.
    fn flush_canceled(&mut self, sink: &DumpSink) {
        if sink.is_empty() {
            return;
        }
        info!(target: "hidumper::dispatch", rows = sink.len(), "Flushing rows produced before cancel");

        for (slot, &id) in self.order.iter().enumerate() {
            let node = self.plan.node(id);
            if !(node.is_filter() || node.is_output()) {
                continue;
            }
            let handle = &mut self.handles[slot];
            if handle.do_pre_execute(node, &self.request, sink, None) != DumpStatus::Ok {
                continue;
            }
            let status = handle.do_execute(node, &self.request, sink);
            if matches!(status, DumpStatus::Ok | DumpStatus::MoreData) {
                handle.do_after_execute(node, &self.request, sink);
            }
        }
    }

    /// Run one full dispatch pass into `sink`, then reset every executor.
    pub fn run(&mut self, sink: &DumpSink) -> DispatchSummary {
        let started = Instant::now();
        let total = self.order.len();
        let callback = self.request.callback.clone();
        let slow_ms = self.request.settings.slow_node_ms;

        let mut summary = DispatchSummary {
            nodes: total,
            ..DispatchSummary::default()
        };
        let mut loop_stack: Vec<usize> = Vec::new();
        let mut last_section = String::new();

        info!(target: "hidumper::dispatch", nodes = total, "Dispatch started");

        let mut i = 0;
        while i < total {
            callback.update_progress(total, i);
            if callback.is_canceled() {
                info!(target: "hidumper::dispatch", index = i, "Canceled");
                summary.canceled = true;
                break;
            }
            summary.steps += 1;

            let id = self.order[i];
            let root_tick = self.root_tick(id);
            let node = self.plan.node(id);
            let handle = &mut self.handles[i];

            if node.is_dumper() && node.section != last_section {
                sink.push_title(&node.section);
                last_section = node.section.clone();
            }

            let timer = PerfTimer::with_threshold(node.name.clone(), slow_ms);

            let status = handle.do_pre_execute(node, &self.request, sink, root_tick);
            if status != DumpStatus::Ok {
                debug!(target: "hidumper::dispatch", node = %node.name, %status, "PreExecute skipped node");
                summary.skipped += 1;
                i += 1;
                continue;
            }

            let status = handle.do_execute(node, &self.request, sink);
            if !matches!(status, DumpStatus::Ok | DumpStatus::MoreData) {
                debug!(target: "hidumper::dispatch", node = %node.name, %status, "Execute failed");
                summary.failed += 1;
                i += 1;
                continue;
            }

            let status = handle.do_after_execute(node, &self.request, sink);
            timer.stop();

            if node.can_loop() && status == DumpStatus::MoreData {
                loop_stack.push(i);
            }

            if node.is_output() || node.is_group() {
                let resume = loop_stack.last().copied();
                loop_stack.clear();
                if let Some(resume) = resume {
                    trace!(target: "hidumper::dispatch", from = i, to = resume, "Rewind");
                    summary.rewinds += 1;
                    i = resume;
                    continue;
                }
            }

            i += 1;
        }

        if summary.canceled {
            self.flush_canceled(sink);
        }

        for handle in &mut self.handles {
            handle.reset();
        }
        callback.update_progress(total, total);

        summary.elapsed = started.elapsed();
        info!(
            target: "hidumper::dispatch",
            nodes = summary.nodes,
            steps = summary.steps,
            skipped = summary.skipped,
            failed = summary.failed,
            rewinds = summary.rewinds,
            canceled = summary.canceled,
            elapsed = %humantime::format_duration(Duration::from_millis(summary.elapsed.as_millis() as u64)),
            "Dispatch finished"
        );
        summary
    }
}

// ============================================================================
// SECTION 17: DATA SOURCE CATALOGUE
// ============================================================================
// The named data sources are data, not engine logic. A catalogue is a TOML
// list of groups, each tagged with the request category that enables it:
//
//   [[group]]
//   name = "cpu_freq"
//   section = "cpufreq"
//   category = "cpu_freq"
//   nesting = "by_cpuid"
//
//     [[group.source]]
//     name = "cur_freq"
//     kind = "file"
//     target = "/sys/devices/system/cpu/cpu%cpuid/cpufreq/scaling_cur_freq"
// ============================================================================

/// Request category that enables a catalogue group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    CpuFreq,
    CpuUsage,
    Log,
    Memory,
    Storage,
    Network,
    Processes,
    Services,
    SystemAbility,
    System,
    FaultLog,
    Test,
}

/// Executor a catalogue source maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Cmd,
    File,
    Ability,
    /// Target names the list: service, ability or system
    List,
    Api,
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueSource {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub target: String,
    #[serde(default, rename = "loop")]
    pub can_loop: bool,
}

impl CatalogueSource {
    fn dumper_kind(&self) -> Result<DumperKind, ConfigError> {
        Ok(match self.kind {
            SourceKind::Cmd => DumperKind::Cmd,
            SourceKind::File => DumperKind::File,
            SourceKind::Ability => DumperKind::Ability,
            SourceKind::Api => DumperKind::Api,
            SourceKind::Version => DumperKind::Version,
            SourceKind::List => DumperKind::List(match self.target.as_str() {
                "service" => ListKind::Service,
                "ability" => ListKind::Ability,
                "system" => ListKind::System,
                other => {
                    return Err(ConfigError::invalid_value(
                        format!("source.{}.target", self.name),
                        format!("Unknown list '{}'", other),
                    ))
                }
            }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueGroup {
    pub name: String,
    pub section: String,
    pub category: Category,
    #[serde(default)]
    pub nesting: NestingType,
    #[serde(default, rename = "source")]
    pub sources: Vec<CatalogueSource>,
}

/// Every known data source group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(default, rename = "group")]
    pub groups: Vec<CatalogueGroup>,
}

impl Catalogue {
    /// The catalogue compiled into the binary.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_str(BUILTIN_CATALOGUE)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let catalogue: Self = toml::from_str(text).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        catalogue.validate()?;
        Ok(catalogue)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(ConfigError::invalid_value("group.name", "Group name is empty"));
            }
            for source in &group.sources {
                if source.name.is_empty() {
                    return Err(ConfigError::invalid_value(
                        format!("group.{}.source.name", group.name),
                        "Source name is empty",
                    ));
                }
                source.dumper_kind()?;
            }
        }
        Ok(())
    }

    pub fn groups_for(&self, category: Category) -> impl Iterator<Item = &CatalogueGroup> + '_ {
        self.groups.iter().filter(move |g| g.category == category)
    }

    pub fn source_count(&self) -> usize {
        self.groups.iter().map(|g| g.sources.len()).sum()
    }
}

// ============================================================================
// SECTION 18: PLAN BUILDER
// ============================================================================

/// One enabled category and the arguments the request gave it.
#[derive(Debug, Clone)]
struct Selection {
    category: Category,
    pid: Option<i32>,
    args: Option<DumpArgs>,
    /// Restrict to these group names when non-empty
    only: Vec<String>,
}

/// Turns request options plus a catalogue into an execution plan.
#[derive(Debug, Clone)]
pub struct PlanBuilder<'a> {
    catalogue: &'a Catalogue,
    proc_root: PathBuf,
    cpu_count: usize,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(catalogue: &'a Catalogue) -> Self {
        Self {
            catalogue,
            proc_root: PathBuf::from("/proc"),
            cpu_count: configured_cpus(),
        }
    }

    /// Where process directories are enumerated from.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn with_cpu_count(mut self, count: usize) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn build(&self, opts: &DumperOpts) -> DumperResult<Plan> {
        opts.validate()?;

        let mut plan = Plan::new();
        if opts.is_show_list {
            self.add_lists(&mut plan, opts);
        } else {
            for selection in Self::selections(opts) {
                self.add_category(&mut plan, &selection)?;
            }
        }

        if plan.dumper_count() == 0 {
            return Err(OptionsError::NothingSelected.into());
        }

        plan.add_root(DumpConfig::new("trim_trailing", NodeKind::Filter(FilterKind::TrimTrailing)));
        let output = if opts.is_zip_output() {
            DumpConfig::output(OutputKind::Zip).with_target(opts.path.clone())
        } else {
            DumpConfig::output(OutputKind::Fd)
        };
        plan.add_root(output);

        debug!(
            target: "hidumper::plan",
            nodes = plan.len(),
            dumpers = plan.dumper_count(),
            "Plan built"
        );
        Ok(plan)
    }

    fn selections(opts: &DumperOpts) -> Vec<Selection> {
        let mut out = Vec::new();
        let mut push = |enabled: bool, category, pid, args, only| {
            if enabled {
                out.push(Selection {
                    category,
                    pid,
                    args,
                    only,
                });
            }
        };

        push(opts.is_dump_cpu_freq, Category::CpuFreq, None, None, Vec::new());
        push(opts.is_dump_cpu_usage, Category::CpuUsage, Some(opts.cpu_usage_pid), None, Vec::new());
        push(
            opts.is_dump_log,
            Category::Log,
            None,
            (!opts.log_args.is_empty()).then(|| DumpArgs::StrList(opts.log_args.clone())),
            Vec::new(),
        );
        push(opts.is_dump_mem, Category::Memory, Some(opts.mem_pid), None, Vec::new());
        push(opts.is_dump_storage, Category::Storage, None, None, Vec::new());
        push(opts.is_dump_net, Category::Network, None, None, Vec::new());
        push(opts.is_dump_processes, Category::Processes, Some(opts.process_pid), None, Vec::new());
        push(
            opts.is_dump_service,
            Category::Services,
            None,
            Some(DumpArgs::NamesAndArgs {
                names: opts.service_names.clone(),
                args: Vec::new(),
            }),
            Vec::new(),
        );
        push(
            opts.is_dump_system_ability,
            Category::SystemAbility,
            None,
            Some(DumpArgs::NamesAndArgs {
                names: opts.ability_names.clone(),
                args: opts.ability_args.clone(),
            }),
            Vec::new(),
        );
        push(opts.is_dump_system, Category::System, None, None, opts.system_args.clone());
        push(opts.is_fault_log, Category::FaultLog, None, None, Vec::new());
        push(opts.is_test, Category::Test, None, None, Vec::new());
        out
    }

    fn add_category(&self, plan: &mut Plan, selection: &Selection) -> DumperResult<()> {
        for group in self.catalogue.groups_for(selection.category) {
            if !selection.only.is_empty() && !selection.only.iter().any(|n| n == &group.name) {
                continue;
            }

            let root = plan.add_root(
                DumpConfig::group(group.name.clone(), NestingType::None).with_section(group.section.clone()),
            );

            match group.nesting {
                NestingType::ByPid => {
                    let pids = match selection.pid {
                        Some(pid) if pid > INVALID_ID => vec![pid],
                        _ => self.list_pids(),
                    };
                    for pid in pids {
                        let args = DumpArgs::Pid {
                            pid,
                            uid: self.pid_uid(pid),
                        };
                        let child = plan.add_child(
                            root,
                            DumpConfig::group(format!("{}_{}", group.name, pid), NestingType::ByPid)
                                .with_section(group.section.clone())
                                .with_args(args.clone()),
                        );
                        self.add_sources(plan, child, group, Some(&args))?;
                    }
                }
                NestingType::ByCpuId => {
                    for cpu in 0..self.cpu_count {
                        let args = DumpArgs::CpuId(cpu as i32);
                        let child = plan.add_child(
                            root,
                            DumpConfig::group(format!("{}_cpu{}", group.name, cpu), NestingType::ByCpuId)
                                .with_section(group.section.clone())
                                .with_args(args.clone()),
                        );
                        self.add_sources(plan, child, group, Some(&args))?;
                    }
                }
                NestingType::None => {
                    let pid_args = selection.pid.filter(|&pid| pid > INVALID_ID).map(|pid| DumpArgs::Pid {
                        pid,
                        uid: self.pid_uid(pid),
                    });
                    let args = selection.args.clone().or(pid_args);
                    self.add_sources(plan, root, group, args.as_ref())?;
                }
            }
        }
        Ok(())
    }

    fn add_sources(
        &self,
        plan: &mut Plan,
        parent: NodeId,
        group: &CatalogueGroup,
        args: Option<&DumpArgs>,
    ) -> DumperResult<()> {
        for source in &group.sources {
            let mut node = DumpConfig::dumper(source.name.clone(), source.dumper_kind()?, source.target.clone())
                .with_section(group.section.clone())
                .with_desc(source.desc.clone())
                .with_loop(source.can_loop);
            node.args = args.cloned();
            plan.add_child(parent, node);
        }
        Ok(())
    }

    fn add_lists(&self, plan: &mut Plan, opts: &DumperOpts) {
        let system_names: Vec<String> = self
            .catalogue
            .groups_for(Category::System)
            .map(|g| g.name.clone())
            .collect();

        let lists = [
            (opts.is_dump_service, ListKind::Service, None),
            (opts.is_dump_system_ability, ListKind::Ability, None),
            (opts.is_dump_system, ListKind::System, Some(DumpArgs::StrList(system_names))),
        ];
        for (enabled, kind, args) in lists {
            if !enabled {
                continue;
            }
            let mut node = DumpConfig::dumper(format!("list_{:?}", kind).to_lowercase(), DumperKind::List(kind), "")
                .with_section("list");
            node.args = args;
            plan.add_root(node);
        }
    }

    /// Numeric entries of the proc root, ascending.
    pub fn list_pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = match fs::read_dir(&self.proc_root) {
            Ok(dir) => dir
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
                .collect(),
            Err(e) => {
                warn!(target: "hidumper::plan", root = %self.proc_root.display(), error = %e, "Process list unavailable");
                Vec::new()
            }
        };
        pids.sort_unstable();
        pids
    }

    fn pid_uid(&self, pid: i32) -> i32 {
        read_status_uid(&self.proc_root.join(pid.to_string()))
            .and_then(|uid| i32::try_from(uid).ok())
            .unwrap_or(INVALID_ID)
    }
}

fn configured_cpus() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if count < 1 {
        1
    } else {
        count as usize
    }
}

// ============================================================================
// SECTION 19: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Category flags mirror the request options one to one. Optional values
// (`--mem [PID]`, `-s [NAME...]`) are present-without-value when given bare.
// ============================================================================

// ----------------------------------------------------------------------------
// 19.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// hidumper CLI
#[derive(Parser, Debug)]
#[command(
    name = "hidumper",
    version,
    about = "Device diagnostics collector",
    long_about = "hidumper collects proc/sysfs files, command output and system ability \
                  dumps under a shared timeout, grouped and titled by category, to the \
                  console or a compressed file."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(long, env = "HIDUMPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(long, env = "HIDUMPER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// CPU frequency of every core
    #[arg(long)]
    pub cpufreq: bool,

    /// CPU usage, of one process when PID is given
    #[arg(long, value_name = "PID", num_args = 0..=1, default_missing_value = "-1")]
    pub cpuusage: Option<i32>,

    /// Kernel and system logs
    #[arg(long, value_name = "ARG", num_args = 0..)]
    pub log: Option<Vec<String>>,

    /// Memory usage, of one process when PID is given
    #[arg(long, value_name = "PID", num_args = 0..=1, default_missing_value = "-1")]
    pub mem: Option<i32>,

    /// Storage usage
    #[arg(long)]
    pub storage: bool,

    /// Network state
    #[arg(long)]
    pub net: bool,

    /// Process information, of one process when PID is given
    #[arg(short = 'p', long = "processes", value_name = "PID", num_args = 0..=1, default_missing_value = "-1")]
    pub processes: Option<i32>,

    /// Services, all when no name is given
    #[arg(short = 's', long = "service", value_name = "NAME", num_args = 0..)]
    pub service: Option<Vec<String>>,

    /// System abilities, all when no name is given
    #[arg(short = 'a', long = "ability", value_name = "NAME", num_args = 0..)]
    pub ability: Option<Vec<String>>,

    /// Arguments forwarded to every dumped system ability
    #[arg(long = "ability-args", value_name = "ARG", num_args = 1.., allow_hyphen_values = true)]
    pub ability_args: Vec<String>,

    /// System clusters, all when no name is given
    #[arg(short = 'c', long = "system", value_name = "NAME", num_args = 0..)]
    pub system: Option<Vec<String>>,

    /// Fault logs
    #[arg(short = 'e', long = "faultlog")]
    pub faultlog: bool,

    /// Self test sources
    #[arg(long)]
    pub test: bool,

    /// List names instead of dumping (with -s, -a or -c)
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// Request timeout in seconds
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Row limit per source
    #[arg(long, value_name = "N")]
    pub limit: Option<u64>,

    /// Write a compressed dump to this absolute path
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Validate configuration and catalogue
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the execution plan as JSON instead of running it
    Plan,
}

impl Cli {
    /// Request options, falling back to configured defaults.
    pub fn to_opts(&self, settings: &EngineSettings) -> DumperOpts {
        let names = |value: &Option<Vec<String>>| value.clone().unwrap_or_default();
        DumperOpts {
            is_dump_cpu_freq: self.cpufreq,
            is_dump_cpu_usage: self.cpuusage.is_some(),
            cpu_usage_pid: self.cpuusage.unwrap_or(INVALID_ID),
            is_dump_log: self.log.is_some(),
            log_args: names(&self.log),
            is_dump_mem: self.mem.is_some(),
            mem_pid: self.mem.unwrap_or(INVALID_ID),
            is_dump_storage: self.storage,
            is_dump_net: self.net,
            is_dump_processes: self.processes.is_some(),
            process_pid: self.processes.unwrap_or(INVALID_ID),
            is_dump_service: self.service.is_some(),
            service_names: names(&self.service),
            is_dump_system_ability: self.ability.is_some(),
            ability_names: names(&self.ability),
            ability_args: self.ability_args.clone(),
            is_dump_system: self.system.is_some(),
            system_args: names(&self.system),
            is_fault_log: self.faultlog,
            is_test: self.test,
            is_show_list: self.list,
            timeout_secs: self.timeout.unwrap_or(settings.default_timeout_secs),
            limit: self.limit.unwrap_or(settings.default_row_limit),
            path: self.output.clone().unwrap_or_default(),
        }
    }
}

// ----------------------------------------------------------------------------
// 19.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Catalogue named by the configuration, or the built-in one.
pub fn load_catalogue(config: &DumperConfig) -> Result<Catalogue, ConfigError> {
    match &config.catalogue.path {
        Some(path) => Catalogue::load(path),
        None => Catalogue::builtin(),
    }
}

/// Handle the validate subcommand
fn handle_validate(config_path: Option<&Path>, verbose: bool) -> DumperResult<()> {
    let config = match config_path {
        Some(path) => {
            println!("Validating configuration file: {}", path.display());
            DumperConfig::load(path)?
        }
        None => DumperConfig::default(),
    };
    let catalogue = load_catalogue(&config)?;

    println!("Configuration is valid");
    if verbose {
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }
    println!("  timeout: {}s", config.engine.default_timeout_secs);
    println!("  zip buffer: {} bytes", config.engine.zip_buffer_size);
    println!(
        "  catalogue: {} groups, {} sources",
        catalogue.groups.len(),
        catalogue.source_count()
    );
    Ok(())
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> DumperResult<()> {
    let config_str = DumperConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, config_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", config_str),
    }
    Ok(())
}

// ============================================================================
// SECTION 20: MAIN ENTRY POINT
// ============================================================================

/// Run a request to completion on the calling thread.
pub fn run_request(plan: Plan, request: RequestContext) -> DispatchSummary {
    let sink = DumpSink::new();
    let mut engine = DumpEngine::new(plan, request);
    engine.run(&sink)
}

/// Run a request on the blocking pool.
pub async fn dump_async(plan: Plan, request: RequestContext) -> DumperResult<DispatchSummary> {
    tokio::task::spawn_blocking(move || run_request(plan, request))
        .await
        .map_err(|e| DumperError::Internal(format!("Dispatch task failed: {}", e)))
}

/// Main entry point for hidumper
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(cli.config.as_deref(), *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = match &cli.config {
        Some(path) => DumperConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DumperConfig::default(),
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    init_logging(&logging_config)?;

    info!(target: "hidumper::init", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let catalogue = load_catalogue(&config).context("Failed to load catalogue")?;
    let opts = cli.to_opts(&config.engine);

    let plan = match PlanBuilder::new(&catalogue).build(&opts) {
        Ok(plan) => plan,
        Err(e) => {
            RawParam::new().write_help(&format!(
                "{}: {}\nTry '{} --help' for more information.",
                ENGINE_NAME, e, ENGINE_NAME
            ));
            return Err(anyhow::Error::new(e).context("Invalid request"));
        }
    };

    if cli.command == Some(Commands::Plan) {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let param = Arc::new(if opts.is_zip_output() {
        RawParam::with_output_path(&opts.path)
            .with_context(|| format!("Failed to create output {}", opts.path))?
    } else {
        RawParam::new()
    });

    let request = RequestContext::new(
        opts,
        config.engine.clone(),
        param.clone(),
        Arc::new(LocalAbilityRegistry::with_builtin()),
    );

    let canceler = param.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "hidumper::init", "Interrupted, canceling request");
            canceler.cancel();
        }
    });

    let summary = dump_async(plan, request).await?;
    if summary.canceled {
        warn!(target: "hidumper::init", "Request canceled, output is partial");
    }

    Ok(())
}

// ============================================================================
// SECTION 21: TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn test_substitute_placeholders() {
        let pid = DumpArgs::Pid { pid: 42, uid: INVALID_ID };
        assert_eq!(
            substitute_placeholders("cat /proc/%pid/stat", Some(&pid)),
            "cat /proc/42/stat"
        );

        let cpu = DumpArgs::CpuId(3);
        assert_eq!(
            substitute_placeholders("cpu%cpuid of %pid", Some(&cpu)),
            "cpu3 of %pid"
        );

        let unset = DumpArgs::Pid { pid: INVALID_ID, uid: INVALID_ID };
        assert_eq!(substitute_placeholders("/proc/%pid", Some(&unset)), "/proc/%pid");
        assert_eq!(substitute_placeholders("/proc/%pid", None), "/proc/%pid");
    }

    #[test]
    fn test_dump_args_accessors() {
        let args = DumpArgs::NamesAndArgs {
            names: vec!["A".into(), "B".into()],
            args: vec!["-h".into()],
        };
        assert_eq!(args.names(), ["A".to_string(), "B".to_string()]);
        assert_eq!(args.forwarded_args(), ["-h".to_string()]);
        assert_eq!(args.pid(), None);

        let pid = DumpArgs::Pid { pid: 7, uid: 1000 };
        assert_eq!(pid.pid(), Some(7));
        assert_eq!(pid.uid(), Some(1000));
        assert!(pid.names().is_empty());
        assert_eq!(DumpArgs::Str("x".into()).str_value(), Some("x"));
    }

    #[test]
    fn test_sink_title_and_drain() {
        let sink = DumpSink::new();
        sink.push_title("memory");
        sink.push_line("MemTotal: 1 kB");

        assert_eq!(
            sink.snapshot(),
            vec![
                Vec::<String>::new(),
                vec!["---[memory]---".to_string()],
                Vec::new(),
                vec!["MemTotal: 1 kB".to_string()],
            ]
        );

        let drained = sink.drain();
        assert_eq!(drained.len(), 4);
        assert!(sink.is_empty());
        assert_eq!(sink.end_position(), 4);
    }

    #[test]
    fn test_sink_update_since_survives_drain() {
        let sink = DumpSink::new();
        sink.push_line("a ");
        let mark = sink.end_position();
        sink.drain();
        sink.push_line("b ");

        let end = sink.update_since(mark, |row| row[0].push('!'));
        assert_eq!(end, 2);
        assert_eq!(lines_of(&sink), vec!["b !".to_string()]);

        // Nothing new since `end`
        sink.update_since(end, |row| row[0].push('?'));
        assert_eq!(lines_of(&sink), vec!["b !".to_string()]);
    }

    fn lines_of(sink: &DumpSink) -> Vec<String> {
        test_support::lines(&sink.snapshot())
    }

    #[test]
    fn test_plan_flatten_depth_first() {
        let mut plan = Plan::new();
        let a = plan.add_root(DumpConfig::group("a", NestingType::None));
        let a1 = plan.add_child(a, DumpConfig::group("a1", NestingType::ByPid));
        plan.add_child(a1, DumpConfig::dumper("a1x", DumperKind::Cmd, "true"));
        plan.add_child(a, DumpConfig::dumper("a2", DumperKind::Version, ""));
        plan.add_root(DumpConfig::output(OutputKind::Fd));

        let names: Vec<&str> = plan
            .flatten()
            .into_iter()
            .map(|id| plan.node(id).name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "a1", "a1x", "a2", "output"]);

        assert_eq!(plan.node(a1).level, 1);
        assert_eq!(plan.parent(a1), Some(a));
        assert_eq!(plan.parent(a), None);
        assert_eq!(plan.dumper_count(), 2);
    }

    #[test]
    fn test_node_kind_predicates() {
        let group = DumpConfig::group("g", NestingType::ByCpuId);
        assert!(group.is_group());
        assert!(!group.is_dumper());

        let mut dumper = DumpConfig::dumper("d", DumperKind::File, "/proc/meminfo");
        assert!(!dumper.is_group());
        dumper.children.push(NodeId(9));
        assert!(dumper.is_group());

        let output = DumpConfig::output(OutputKind::Zip);
        assert!(output.is_output());
        assert!(!output.can_loop());
        assert!(DumpConfig::new("f", NodeKind::Filter(FilterKind::TrimTrailing)).is_filter());
    }

    #[test]
    fn test_options_validation() {
        assert_eq!(DumperOpts::default().validate(), Ok(()));

        let opts = DumperOpts {
            mem_pid: -2,
            ..DumperOpts::default()
        };
        assert_eq!(
            opts.validate(),
            Err(OptionsError::InvalidPid {
                field: "mem_pid",
                value: -2
            })
        );

        let opts = DumperOpts {
            is_show_list: true,
            is_dump_mem: true,
            ..DumperOpts::default()
        };
        assert_eq!(opts.validate(), Err(OptionsError::ListWithoutTarget));

        let opts = DumperOpts {
            path: "relative/out.zst".into(),
            ..DumperOpts::default()
        };
        assert!(matches!(opts.validate(), Err(OptionsError::RelativePath { .. })));

        let opts = DumperOpts {
            timeout_secs: 0,
            ..DumperOpts::default()
        };
        assert!(matches!(opts.validate(), Err(OptionsError::InvalidTimeout { .. })));

        let opts = DumperOpts {
            limit: 0,
            ..DumperOpts::default()
        };
        assert_eq!(opts.validate(), Err(OptionsError::InvalidLimit));
    }

    #[test]
    fn test_options_selection() {
        let mut opts = DumperOpts::default();
        assert!(!opts.is_select_any());
        assert!(!opts.is_zip_output());

        opts.is_dump_net = true;
        opts.path = "/tmp/out.zst".into();
        assert!(opts.is_select_any());
        assert!(opts.is_zip_output());
    }

    #[test]
    fn test_config_defaults() {
        let config = DumperConfig::default();
        assert_eq!(config.engine.default_timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.engine.zip_buffer_size, DEFAULT_ZIP_BUFFER_SIZE);
        assert_eq!(config.engine.stack_min_uid, DEFAULT_STACK_MIN_UID);
        assert_eq!(config.logging.level, "warn");
        assert!(config.catalogue.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_str() {
        let config = DumperConfig::from_str(
            r#"
            [engine]
            default_timeout_secs = 5
            zip_buffer_size = 4096

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.default_timeout_secs, 5);
        assert_eq!(config.engine.zip_buffer_size, 4096);
        assert_eq!(config.engine.list_names_per_row, DEFAULT_LIST_NAMES_PER_ROW);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let err = DumperConfig::from_str("[engine]\nzip_buffer_size = 4\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "engine.zip_buffer_size"));

        let err = DumperConfig::from_str("[engine]\ndefault_timeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = DumperConfig::from_str("[engine\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_config_load_missing_file() {
        let err = DumperConfig::load("/nonexistent/hidumper.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hidumper.toml");
        fs::write(&path, "[engine]\nlist_name_width = 12\n").unwrap();

        let config = DumperConfig::load(&path).unwrap();
        assert_eq!(config.engine.list_name_width, 12);
    }

    #[test]
    fn test_generated_config_parses_back() {
        let text = DumperConfig::generate_default_config();
        let config = DumperConfig::from_str(&text).unwrap();
        assert_eq!(config.engine.zstd_level, DEFAULT_ZSTD_LEVEL);
    }

    #[test]
    fn test_error_categories() {
        let err: DumperError = OptionsError::InvalidLimit.into();
        assert_eq!(err.category(), "options");
        assert!(!err.is_recoverable());

        let err: DumperError = ExecutorError::NotUserProcess { pid: 1 }.into();
        assert_eq!(err.category(), "executor");
        assert!(!err.is_recoverable());

        let err: DumperError = AbilityError::NotFound { name: "x".into() }.into();
        assert_eq!(err.category(), "ability");
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_deadline_from_root() {
        let root = Instant::now();
        let at = root + Duration::from_millis(100);
        let deadline = Deadline::from_root(root, at, Duration::from_secs(1));
        assert_eq!(deadline.remain_ms(), 900);

        let late = Deadline::from_root(root, root + Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(late.remain_ms(), -1000);
        assert!(late.is_expired());

        assert!(!Deadline::unbounded().is_expired());
    }

    #[test]
    fn test_line_reader_peeks_for_more() {
        let sink = DumpSink::new();
        let mut reader = LineReader::new(Cursor::new("a\nb\nc\n"), u64::MAX);
        assert_eq!(reader.read_line(&sink), DumpStatus::MoreData);
        assert_eq!(reader.read_line(&sink), DumpStatus::MoreData);
        assert_eq!(reader.read_line(&sink), DumpStatus::Ok);
        assert_eq!(lines_of(&sink), vec!["a", "b", "c"]);

        let sink = DumpSink::new();
        let mut reader = LineReader::new(Cursor::new("x\ny"), u64::MAX);
        assert_eq!(reader.read_line(&sink), DumpStatus::MoreData);
        assert_eq!(reader.read_line(&sink), DumpStatus::Ok);
        assert_eq!(lines_of(&sink), vec!["x", "y"]);
    }

    #[test]
    fn test_line_reader_limit() {
        let sink = DumpSink::new();
        let mut reader = LineReader::new(Cursor::new("1\n2\n3\n"), 2);
        assert_eq!(reader.read_line(&sink), DumpStatus::MoreData);
        assert_eq!(reader.read_line(&sink), DumpStatus::Ok);
        assert_eq!(reader.read_line(&sink), DumpStatus::Ok);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_registry_resolve() {
        let registry = LocalAbilityRegistry::with_builtin();
        assert_eq!(registry.resolve("HiDumperService"), Some(1));
        assert_eq!(registry.resolve("2"), Some(2));
        assert_eq!(registry.resolve("99"), None);
        assert_eq!(registry.resolve("Nope"), None);
        assert_eq!(
            registry.list_abilities(),
            vec!["HiDumperService".to_string(), "ProcessInfo".to_string()]
        );
    }

    #[test]
    fn test_raw_param_cancel_and_progress() {
        let param = RawParam::new();
        assert!(!param.is_canceled());
        assert!(param.output_fd().is_none());

        param.update_progress(10, 3);
        assert_eq!(param.progress(), (10, 3));

        param.cancel();
        assert!(param.is_canceled());
    }

    #[test]
    fn test_request_context_timeout() {
        let (_param, request) = test_support::request();
        assert_eq!(request.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(request.caller_pid, std::process::id());

        let request = request.with_timeout(Duration::from_millis(5));
        assert_eq!(request.timeout, Duration::from_millis(5));
        assert_eq!(request.output_path(), "");
    }

    #[test]
    fn test_perf_timer() {
        let timer = PerfTimer::with_threshold("node", 10_000);
        assert!(timer.stop() < 10_000);
    }
}


#[cfg(test)]
mod output_tests {
    use super::test_support::{drive, request_with};
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn compress_rows(rows: &[Row], capacity: usize) -> (Vec<u8>, u64) {
        let mut buffers = ZipBuffers::new(capacity);
        let mut compressor = ZstdCompressor::default();
        let mut dest = Vec::new();
        for row in rows {
            for cell in row {
                buffers.append(cell.as_bytes(), &mut compressor, &mut dest).unwrap();
            }
            buffers.append(b"\n", &mut compressor, &mut dest).unwrap();
        }
        buffers.flush(&mut compressor, &mut dest).unwrap();
        (dest, buffers.frames())
    }

    fn rendered(rows: &[Row]) -> String {
        rows.iter().map(render_row).collect()
    }

    fn file_request(path: &Path) -> (Arc<RawParam>, RequestContext) {
        let param = Arc::new(RawParam::with_output_path(path).unwrap());
        let request = RequestContext::new(
            DumperOpts::default(),
            EngineSettings::default(),
            param.clone(),
            Arc::new(LocalAbilityRegistry::new()),
        );
        (param, request)
    }

    #[test]
    fn test_render_row() {
        assert_eq!(render_row(&vec!["a".into(), "b".into()]), "ab\n");
        assert_eq!(render_row(&Vec::new()), "\n");
    }

    #[rstest]
    #[case::exactly_buffer(16)]
    #[case::one_over(17)]
    #[case::one_under(15)]
    #[case::far_over(50)]
    fn test_zip_cell_boundaries_round_trip(#[case] cell_len: usize) {
        let rows: Vec<Row> = vec![
            vec!["x".repeat(cell_len)],
            vec!["y".repeat(cell_len), "z".to_string()],
            Vec::new(),
        ];
        let (compressed, _) = compress_rows(&rows, 16);
        let decoded = zstd::stream::decode_all(&compressed[..]).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), rendered(&rows));
    }

    #[test]
    fn test_zip_buffer_flush_points() {
        let mut compressor = ZstdCompressor::default();
        let mut dest = Vec::new();

        let mut buffers = ZipBuffers::new(16);
        buffers.append(&[b'a'; 16], &mut compressor, &mut dest).unwrap();
        assert_eq!((buffers.frames(), buffers.pending()), (0, 16));
        buffers.flush(&mut compressor, &mut dest).unwrap();

        let mut buffers = ZipBuffers::new(16);
        buffers.append(&[b'a'; 17], &mut compressor, &mut dest).unwrap();
        assert_eq!((buffers.frames(), buffers.pending()), (2, 0));
        assert_eq!(buffers.flushed_bytes(), 17);

        let mut buffers = ZipBuffers::new(16);
        buffers.append(&[b'a'; 15], &mut compressor, &mut dest).unwrap();
        buffers.append(b"b", &mut compressor, &mut dest).unwrap();
        assert_eq!((buffers.frames(), buffers.pending()), (0, 16));
        buffers.append(b"c", &mut compressor, &mut dest).unwrap();
        assert_eq!((buffers.frames(), buffers.pending()), (1, 1));
        buffers.flush(&mut compressor, &mut dest).unwrap();
        assert_eq!(buffers.pending(), 0);
    }

    proptest! {
        #[test]
        fn test_zip_round_trip_arbitrary_rows(
            rows in proptest::collection::vec(
                proptest::collection::vec("[a-z0-9 ]{0,40}", 0..4),
                1..40,
            ),
            capacity in 16usize..64,
        ) {
            let (compressed, _) = compress_rows(&rows, capacity);
            let decoded = zstd::stream::decode_all(&compressed[..]).unwrap();
            prop_assert_eq!(decoded, rendered(&rows).into_bytes());
        }
    }

    #[test]
    fn test_zip_output_writes_to_request_fd() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.zst");
        let (_param, request) = file_request(&path);

        let sink = DumpSink::new();
        sink.push_title("memory");
        sink.push_line("MemTotal:       16384 kB");
        sink.push_row(vec!["a".repeat(100), "b".into()]);
        let expected = rendered(&sink.snapshot());

        let node = DumpConfig::output(OutputKind::Zip);
        let mut output = ZipOutput::new(32, Box::new(ZstdCompressor::default()));
        assert_eq!(drive(&mut output, &node, &request, &sink), vec![DumpStatus::Ok]);
        assert!(sink.is_empty());

        let compressed = fs::read(&path).unwrap();
        let decoded = zstd::stream::decode_all(&compressed[..]).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), expected);
    }

    #[test]
    fn test_zip_output_without_fd_fails() {
        let (_param, request) = request_with(DumperOpts::default(), Arc::new(LocalAbilityRegistry::new()));
        let sink = DumpSink::new();
        sink.push_line("x");

        let node = DumpConfig::output(OutputKind::Zip);
        let mut output = ZipOutput::new(32, Box::new(ZstdCompressor::default()));
        assert_eq!(drive(&mut output, &node, &request, &sink), vec![DumpStatus::Fail]);
        assert_eq!(sink.len(), 1);
    }

    struct BrokenCompressor;

    impl Compressor for BrokenCompressor {
        fn compress(&mut self, _src: &[u8]) -> OutputResult<Vec<u8>> {
            Err(OutputError::CompressionFailed {
                message: "broken".into(),
            })
        }
    }

    #[test]
    fn test_zip_output_compression_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_param, request) = file_request(&dir.path().join("dump.zst"));
        let sink = DumpSink::new();
        sink.push_line("y".repeat(64));

        let node = DumpConfig::output(OutputKind::Zip);
        let mut output = ZipOutput::new(16, Box::new(BrokenCompressor));
        assert_eq!(drive(&mut output, &node, &request, &sink), vec![DumpStatus::Fail]);
    }

    #[test]
    fn test_fd_output_writes_rendered_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let (_param, request) = file_request(&path);

        let sink = DumpSink::new();
        sink.push_line("x");
        sink.push_blank();
        sink.push_row(vec!["y".into(), "z".into()]);

        let node = DumpConfig::output(OutputKind::Fd);
        assert_eq!(
            drive(&mut FdOutput::new(), &node, &request, &sink),
            vec![DumpStatus::Ok]
        );
        assert!(sink.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "x\n\nyz\n");
    }

    #[test]
    fn test_file_output_truncates_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, "stale\n").unwrap();

        let (_param, request) = request_with(DumperOpts::default(), Arc::new(LocalAbilityRegistry::new()));
        let node = DumpConfig::output(OutputKind::File).with_target(path.to_string_lossy());
        let mut output = FileOutput::new();
        let sink = DumpSink::new();

        sink.push_line("first");
        drive(&mut output, &node, &request, &sink);
        sink.push_line("second");
        drive(&mut output, &node, &request, &sink);
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        output.reset();
        sink.push_line("again");
        drive(&mut output, &node, &request, &sink);
        assert_eq!(fs::read_to_string(&path).unwrap(), "again\n");
    }

    #[test]
    fn test_file_output_without_target_fails() {
        let (_param, request) = request_with(DumperOpts::default(), Arc::new(LocalAbilityRegistry::new()));
        let node = DumpConfig::output(OutputKind::File);
        let sink = DumpSink::new();
        assert_eq!(
            drive(&mut FileOutput::new(), &node, &request, &sink),
            vec![DumpStatus::Fail]
        );
    }
}


#[cfg(test)]
mod plan_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEST_CATALOGUE: &str = r#"
[[group]]
name = "memory"
section = "memory"
category = "memory"

  [[group.source]]
  name = "meminfo"
  kind = "file"
  target = "/proc/meminfo"

[[group]]
name = "memory_proc"
section = "memory"
category = "memory"
nesting = "by_pid"

  [[group.source]]
  name = "proc_status"
  kind = "file"
  target = "/proc/%pid/status"

[[group]]
name = "cpu_freq"
section = "cpufreq"
category = "cpu_freq"
nesting = "by_cpuid"

  [[group.source]]
  name = "cur_freq"
  kind = "file"
  target = "/sys/devices/system/cpu/cpu%cpuid/cpufreq/scaling_cur_freq"
  loop = true

[[group]]
name = "base"
section = "base"
category = "system"

  [[group.source]]
  name = "version"
  kind = "version"

[[group]]
name = "kernel"
section = "kernel"
category = "system"

  [[group.source]]
  name = "kernel_version"
  kind = "file"
  target = "/proc/version"
"#;

    fn catalogue() -> Catalogue {
        Catalogue::from_str(TEST_CATALOGUE).unwrap()
    }

    fn names(plan: &Plan) -> Vec<String> {
        plan.flatten().into_iter().map(|id| plan.node(id).name.clone()).collect()
    }

    fn find(plan: &Plan, name: &str) -> NodeId {
        plan.flatten()
            .into_iter()
            .find(|&id| plan.node(id).name == name)
            .unwrap()
    }

    fn fake_proc() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for entry in ["1", "42", "self"] {
            fs::create_dir(dir.path().join(entry)).unwrap();
        }
        fs::write(
            dir.path().join("42").join("status"),
            "Name:\tworker\nUid:\t1000\t1000\t1000\t1000\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_builtin_catalogue_covers_every_category() {
        let catalogue = Catalogue::builtin().unwrap();
        for category in [
            Category::CpuFreq,
            Category::CpuUsage,
            Category::Log,
            Category::Memory,
            Category::Storage,
            Category::Network,
            Category::Processes,
            Category::Services,
            Category::SystemAbility,
            Category::System,
            Category::FaultLog,
            Category::Test,
        ] {
            assert!(
                catalogue.groups_for(category).next().is_some(),
                "no group for {:?}",
                category
            );
        }
        assert!(catalogue
            .groups
            .iter()
            .flat_map(|g| g.sources.iter())
            .any(|s| s.name == STACK_DUMP_SOURCE && s.kind == SourceKind::Cmd));
    }

    #[test]
    fn test_builtin_catalogue_keeps_cpu_nesting() {
        let catalogue = Catalogue::builtin().unwrap();
        let cpu_freq = catalogue.groups.iter().find(|g| g.name == "cpu_freq").unwrap();
        assert_eq!(cpu_freq.nesting, NestingType::ByCpuId);
        assert_eq!(serde_json::to_string(&NestingType::ByCpuId).unwrap(), "\"by_cpuid\"");
        assert_eq!(serde_json::to_string(&NestingType::ByPid).unwrap(), "\"by_pid\"");
    }

    #[test]
    fn test_builtin_log_sources_are_read_to_the_end() {
        use super::test_support::{captured_lines, request, scripted_engine};

        let catalogue = Catalogue::builtin().unwrap();
        let opts = DumperOpts {
            is_dump_log: true,
            ..DumperOpts::default()
        };
        let mut plan = PlanBuilder::new(&catalogue).build(&opts).unwrap();
        let kernel = find(&plan, "kernel_log");
        let journal = find(&plan, "journal");
        assert!(plan.node(kernel).can_loop() && plan.node(journal).can_loop());
        plan.node_mut(kernel).target = "printf 'k1\\nk2\\nk3\\n'".into();
        plan.node_mut(journal).target = "printf 'j1\\nj2\\nj3\\n'".into();

        let (_param, request) = request();
        let batches = Arc::default();
        scripted_engine(plan, request, HashMap::new(), &batches).run(&DumpSink::new());

        let data: Vec<String> = captured_lines(&batches)
            .into_iter()
            .filter(|line| line.len() == 2 && (line.starts_with('k') || line.starts_with('j')))
            .collect();
        assert_eq!(data, vec!["k1", "k2", "k3", "j1", "j2", "j3"]);
    }

    #[test]
    fn test_catalogue_rejects_unknown_list() {
        let err = Catalogue::from_str(
            r#"
            [[group]]
            name = "lists"
            section = "list"
            category = "services"

              [[group.source]]
              name = "bogus"
              kind = "list"
              target = "bogus"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_by_pid_expands_every_process() {
        let proc_root = fake_proc();
        let catalogue = catalogue();
        let opts = DumperOpts {
            is_dump_mem: true,
            ..DumperOpts::default()
        };

        let plan = PlanBuilder::new(&catalogue)
            .with_proc_root(proc_root.path())
            .build(&opts)
            .unwrap();

        assert_eq!(
            names(&plan),
            vec![
                "memory",
                "meminfo",
                "memory_proc",
                "memory_proc_1",
                "proc_status",
                "memory_proc_42",
                "proc_status",
                "trim_trailing",
                "output",
            ]
        );

        let group = find(&plan, "memory_proc_42");
        assert_eq!(plan.node(group).nesting, NestingType::ByPid);
        let source = plan.node(group).children[0];
        assert_eq!(
            plan.node(source).args,
            Some(DumpArgs::Pid { pid: 42, uid: 1000 })
        );

        let group = find(&plan, "memory_proc_1");
        assert_eq!(
            plan.node(group).args,
            Some(DumpArgs::Pid { pid: 1, uid: INVALID_ID })
        );
        assert_eq!(plan.node(find(&plan, "meminfo")).args, None);
    }

    #[test]
    fn test_by_pid_single_requested_pid() {
        let proc_root = fake_proc();
        let catalogue = catalogue();
        let opts = DumperOpts {
            is_dump_mem: true,
            mem_pid: 42,
            ..DumperOpts::default()
        };

        let plan = PlanBuilder::new(&catalogue)
            .with_proc_root(proc_root.path())
            .build(&opts)
            .unwrap();

        let names = names(&plan);
        assert!(names.contains(&"memory_proc_42".to_string()));
        assert!(!names.contains(&"memory_proc_1".to_string()));
        assert_eq!(
            plan.node(find(&plan, "meminfo")).args,
            Some(DumpArgs::Pid { pid: 42, uid: 1000 })
        );
    }

    #[test]
    fn test_by_cpuid_expands_per_cpu() {
        let catalogue = catalogue();
        let opts = DumperOpts {
            is_dump_cpu_freq: true,
            ..DumperOpts::default()
        };

        let plan = PlanBuilder::new(&catalogue).with_cpu_count(2).build(&opts).unwrap();
        assert_eq!(
            names(&plan),
            vec![
                "cpu_freq",
                "cpu_freq_cpu0",
                "cur_freq",
                "cpu_freq_cpu1",
                "cur_freq",
                "trim_trailing",
                "output",
            ]
        );

        let group = find(&plan, "cpu_freq_cpu1");
        let source = plan.node(plan.node(group).children[0]);
        assert_eq!(source.args, Some(DumpArgs::CpuId(1)));
        assert!(source.can_loop());
        assert_eq!(source.section, "cpufreq");
        assert_eq!(source.level, 2);
    }

    #[test]
    fn test_output_kind_follows_path() {
        let catalogue = catalogue();
        let mut opts = DumperOpts {
            is_dump_system: true,
            ..DumperOpts::default()
        };

        let plan = PlanBuilder::new(&catalogue).build(&opts).unwrap();
        let last = *plan.roots().last().unwrap();
        assert_eq!(plan.node(last).kind, NodeKind::Output(OutputKind::Fd));

        opts.path = "/tmp/hidumper/dump.zst".into();
        let plan = PlanBuilder::new(&catalogue).build(&opts).unwrap();
        let last = *plan.roots().last().unwrap();
        assert_eq!(plan.node(last).kind, NodeKind::Output(OutputKind::Zip));
    }

    #[test]
    fn test_nothing_selected() {
        let catalogue = catalogue();
        let err = PlanBuilder::new(&catalogue).build(&DumperOpts::default()).unwrap_err();
        assert!(matches!(err, DumperError::Options(OptionsError::NothingSelected)));

        // Category with no catalogue entries
        let opts = DumperOpts {
            is_dump_net: true,
            ..DumperOpts::default()
        };
        assert!(PlanBuilder::new(&catalogue).build(&opts).is_err());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let catalogue = catalogue();
        let opts = DumperOpts {
            is_dump_system: true,
            path: "relative.zst".into(),
            ..DumperOpts::default()
        };
        let err = PlanBuilder::new(&catalogue).build(&opts).unwrap_err();
        assert!(matches!(err, DumperError::Options(OptionsError::RelativePath { .. })));
    }

    #[test]
    fn test_system_cluster_filter() {
        let catalogue = catalogue();
        let opts = DumperOpts {
            is_dump_system: true,
            system_args: vec!["base".into()],
            ..DumperOpts::default()
        };

        let plan = PlanBuilder::new(&catalogue).build(&opts).unwrap();
        assert_eq!(names(&plan), vec!["base", "version", "trim_trailing", "output"]);
    }

    #[test]
    fn test_list_mode_builds_list_nodes() {
        let catalogue = catalogue();
        let opts = DumperOpts {
            is_show_list: true,
            is_dump_system: true,
            is_dump_system_ability: true,
            ..DumperOpts::default()
        };

        let plan = PlanBuilder::new(&catalogue).build(&opts).unwrap();
        assert_eq!(
            names(&plan),
            vec!["list_ability", "list_system", "trim_trailing", "output"]
        );

        let system = plan.node(find(&plan, "list_system"));
        assert_eq!(system.kind, NodeKind::Dumper(DumperKind::List(ListKind::System)));
        assert_eq!(
            system.args,
            Some(DumpArgs::StrList(vec!["base".into(), "kernel".into()]))
        );
    }

    #[test]
    fn test_service_selection_carries_names() {
        let catalogue = Catalogue::builtin().unwrap();
        let opts = DumperOpts {
            is_dump_system_ability: true,
            ability_names: vec!["HiDumperService".into()],
            ability_args: vec!["-h".into()],
            ..DumperOpts::default()
        };

        let plan = PlanBuilder::new(&catalogue).build(&opts).unwrap();
        let node = plan.node(find(&plan, "ability_dump"));
        assert_eq!(
            node.args,
            Some(DumpArgs::NamesAndArgs {
                names: vec!["HiDumperService".into()],
                args: vec!["-h".into()],
            })
        );
    }

    #[test]
    fn test_plan_serializes_to_json() {
        let catalogue = catalogue();
        let opts = DumperOpts {
            is_dump_system: true,
            ..DumperOpts::default()
        };
        let plan = PlanBuilder::new(&catalogue).build(&opts).unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        assert!(json.contains("\"kernel_version\""));
    }

    #[test]
    fn test_cli_to_opts() {
        let settings = EngineSettings::default();
        let cli = Cli::try_parse_from(["hidumper", "--mem", "42", "-t", "5", "--net"]).unwrap();
        let opts = cli.to_opts(&settings);
        assert!(opts.is_dump_mem);
        assert_eq!(opts.mem_pid, 42);
        assert_eq!(opts.timeout_secs, 5);
        assert!(opts.is_dump_net);
        assert!(!opts.is_dump_cpu_usage);
        assert_eq!(opts.limit, DEFAULT_ROW_LIMIT);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_bare_pid_flag_means_all() {
        let settings = EngineSettings::default();
        let cli = Cli::try_parse_from(["hidumper", "--cpuusage", "--storage"]).unwrap();
        let opts = cli.to_opts(&settings);
        assert!(opts.is_dump_cpu_usage);
        assert_eq!(opts.cpu_usage_pid, INVALID_ID);
        assert!(opts.is_dump_storage);
        assert_eq!(opts.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_cli_names_and_output() {
        let settings = EngineSettings::default();
        let cli = Cli::try_parse_from([
            "hidumper",
            "-a",
            "HiDumperService",
            "ProcessInfo",
            "-o",
            "/tmp/out.zst",
        ])
        .unwrap();
        let opts = cli.to_opts(&settings);
        assert!(opts.is_dump_system_ability);
        assert_eq!(opts.ability_names, vec!["HiDumperService", "ProcessInfo"]);
        assert!(opts.is_zip_output());
    }

    #[test]
    fn test_cli_subcommands() {
        let cli = Cli::try_parse_from(["hidumper", "--test", "plan"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Plan));

        let cli = Cli::try_parse_from(["hidumper", "validate", "--verbose"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Validate { verbose: true }));
    }

    #[test]
    fn test_load_catalogue_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalogue.toml");
        fs::write(&path, TEST_CATALOGUE).unwrap();

        let mut config = DumperConfig::default();
        config.catalogue.path = Some(path);
        assert_eq!(load_catalogue(&config).unwrap(), catalogue());

        config.catalogue.path = Some(dir.path().join("missing.toml"));
        assert!(matches!(
            load_catalogue(&config),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}
