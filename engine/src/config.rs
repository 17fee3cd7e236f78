//! Configuration loading and resolution for the Scrutiny engine.
//!
//! Supports a 3-level resolution order:
//! 1. `scrutiny.toml` (project root)
//! 2. `[tool.scrutiny]` section in `pyproject.toml`
//! 3. Built-in defaults
//!
//! Environment variables override file config for the small set of knobs
//! the external contract names: `SCRUTINY_STATE_DIR` (state directory) and
//! `SCRUTINY_EMBEDDER` (embedding provider selection). `SCRUTINY_LOG` is
//! consumed by the binary's logger init, not here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::Severity;

/// Per-rule severity override, or `Off` to disable an issue type entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOverride {
    /// Override severity to Critical.
    Critical,
    /// Override severity to High.
    High,
    /// Override severity to Medium.
    Medium,
    /// Override severity to Low.
    Low,
    /// Override severity to Cosmetic.
    Cosmetic,
    /// Disable the rule entirely.
    Off,
}

impl RuleOverride {
    fn as_severity(self) -> Option<Severity> {
        match self {
            Self::Critical => Some(Severity::Critical),
            Self::High => Some(Severity::High),
            Self::Medium => Some(Severity::Medium),
            Self::Low => Some(Severity::Low),
            Self::Cosmetic => Some(Severity::Cosmetic),
            Self::Off => None,
        }
    }
}

/// Hybrid search weighting and normalization knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Weight applied to normalized keyword scores in hybrid merge.
    pub keyword_weight: f32,
    /// Weight applied to normalized semantic scores in hybrid merge.
    pub semantic_weight: f32,
    /// Alpha in the keyword normalization `1 - exp(-hits * alpha)`.
    pub keyword_alpha: f32,
    /// Minimum score a search must reach when the caller passes no floor.
    pub default_min_score: f32,
    /// Score an exact-content match must reach in hybrid mode (round-trip
    /// property). Hybrid scores top out at `semantic_weight`, so the floor
    /// sits just under it.
    pub exact_match_floor: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.4,
            semantic_weight: 0.6,
            keyword_alpha: 0.6,
            default_min_score: 0.1,
            exact_match_floor: 0.55,
        }
    }
}

/// Memory engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum content bytes per memory entry; larger writes are rejected.
    pub max_content_bytes: usize,
    /// Number of writes between vector-index flushes to disk.
    pub index_flush_interval: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: 64 * 1024,
            index_flush_interval: 64,
        }
    }
}

/// False-positive detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpConfig {
    /// Confidence at or above which an issue is suppressed.
    pub suppress_threshold: f32,
    /// How many similar past memories to retrieve per assessment.
    pub top_k: usize,
}

impl Default for FpConfig {
    fn default() -> Self {
        Self {
            suppress_threshold: 0.85,
            top_k: 8,
        }
    }
}

/// Safety gate policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Whether policy auto-approval is permitted at all.
    pub auto_approve: bool,
    /// Baseline safety score required for auto-approval.
    pub auto_threshold: u8,
    /// Backups retained per file ("keep last N").
    pub backups_per_file: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            auto_approve: true,
            auto_threshold: 98,
            backups_per_file: 3,
        }
    }
}

/// Sandbox resource and isolation budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget in seconds.
    pub wall_secs: u64,
    /// CPU-seconds limit for the child process.
    pub cpu_secs: u64,
    /// Address-space limit in bytes.
    pub memory_bytes: u64,
    /// Open-file-descriptor limit.
    pub max_open_files: u64,
    /// Whether loopback networking is permitted for test harnesses.
    pub allow_loopback: bool,
    /// Cap on total bytes copied into the working copy.
    pub max_copy_bytes: u64,
    /// Treat unavailable network isolation as a security violation.
    pub strict_isolation: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            wall_secs: 30,
            cpu_secs: 20,
            memory_bytes: 1 << 30,
            max_open_files: 256,
            allow_loopback: false,
            max_copy_bytes: 256 << 20,
            strict_isolation: false,
        }
    }
}

/// Pruning strategy parameters and the startup auto-trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Namespace size that fires the hybrid auto-prune on startup.
    pub auto_threshold: usize,
    /// Age-based: memories older than this are candidates.
    pub max_age_days: i64,
    /// Age-based: recent reads/matches within this window keep a memory.
    pub refresh_window_days: i64,
    /// Quality-based: memories scoring below this are dropped.
    pub min_quality: f32,
    /// Redundancy-based: cosine similarity at which entries cluster.
    pub redundancy_threshold: f32,
    /// Cap on removals in a single pruning run.
    pub max_removed_per_run: usize,
    /// Whether the `false-positives` namespace may ever be pruned.
    pub allow_fp_prune: bool,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            auto_threshold: 10_000,
            max_age_days: 180,
            refresh_window_days: 30,
            min_quality: 0.2,
            redundancy_threshold: 0.92,
            max_removed_per_run: 1000,
            allow_fp_prune: false,
        }
    }
}

/// Complete engine configuration.
///
/// Loaded via the 3-level resolution order, then adjusted by environment
/// overrides. Passed by reference to every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// State directory holding `memory.db`, `index/`, `backups/`, `logs/`.
    pub state_dir: PathBuf,

    /// Embedding provider: `"hash"` or `"disabled"`.
    pub embedder: String,

    /// Files larger than this many bytes are skipped by the scanner.
    pub max_file_bytes: u64,

    /// Analyzer worker threads (0 = number of CPUs).
    pub analyzer_threads: usize,

    /// Per-file analysis wall budget in milliseconds.
    pub analyzer_timeout_ms: u64,

    /// Extra exclusion patterns (beyond `.gitignore` and hardcoded dirs).
    pub exclude: Vec<String>,

    /// Per-rule severity overrides (issue type → override).
    pub rules: HashMap<String, RuleOverride>,

    /// Hybrid search knobs.
    pub search: SearchConfig,

    /// Memory engine limits.
    pub memory: MemoryConfig,

    /// False-positive detector thresholds.
    pub fp: FpConfig,

    /// Safety gate policy.
    pub gate: GateConfig,

    /// Sandbox budget.
    pub sandbox: SandboxConfig,

    /// Pruning parameters.
    pub pruning: PruningConfig,

    /// Whether the scan cache is disabled for this run.
    pub no_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            embedder: "hash".to_owned(),
            max_file_bytes: 1024 * 1024,
            analyzer_threads: 0,
            analyzer_timeout_ms: 10_000,
            exclude: Vec::new(),
            rules: HashMap::new(),
            search: SearchConfig::default(),
            memory: MemoryConfig::default(),
            fp: FpConfig::default(),
            gate: GateConfig::default(),
            sandbox: SandboxConfig::default(),
            pruning: PruningConfig::default(),
            no_cache: false,
        }
    }
}

/// Default state directory: `~/.scrutiny`, or `.scrutiny` in the current
/// directory when no home is resolvable.
fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".scrutiny"))
        .unwrap_or_else(|| PathBuf::from(".scrutiny"))
}

// ---------------------------------------------------------------------------
// TOML deserialization helpers
// ---------------------------------------------------------------------------

/// Raw TOML structure for `scrutiny.toml`.
#[derive(Debug, Default, Deserialize)]
struct TomlFile {
    engine: Option<TomlEngineSection>,
    rules: Option<HashMap<String, String>>,
    search: Option<SearchConfig>,
    memory: Option<MemoryConfig>,
    fp: Option<FpConfig>,
    gate: Option<GateConfig>,
    sandbox: Option<SandboxConfig>,
    pruning: Option<PruningConfig>,
}

#[derive(Debug, Deserialize)]
struct TomlEngineSection {
    state_dir: Option<String>,
    embedder: Option<String>,
    max_file_bytes: Option<u64>,
    analyzer_threads: Option<usize>,
    analyzer_timeout_ms: Option<u64>,
    exclude: Option<Vec<String>>,
}

/// Raw TOML structure for `pyproject.toml` with `[tool.scrutiny]`.
#[derive(Debug, Deserialize)]
struct PyprojectToml {
    tool: Option<PyprojectTool>,
}

#[derive(Debug, Deserialize)]
struct PyprojectTool {
    scrutiny: Option<TomlFile>,
}

/// Parse a string override value into a [`RuleOverride`].
fn parse_rule_override(s: &str) -> Option<RuleOverride> {
    match s.to_lowercase().as_str() {
        "critical" => Some(RuleOverride::Critical),
        "high" => Some(RuleOverride::High),
        "medium" => Some(RuleOverride::Medium),
        "low" => Some(RuleOverride::Low),
        "cosmetic" => Some(RuleOverride::Cosmetic),
        "off" | "disabled" | "false" => Some(RuleOverride::Off),
        _ => None,
    }
}

/// Apply a parsed TOML file onto a config, overriding any set values.
fn apply_toml(config: &mut EngineConfig, parsed: &TomlFile) {
    if let Some(ref engine) = parsed.engine {
        if let Some(ref v) = engine.state_dir {
            config.state_dir = PathBuf::from(v);
        }
        if let Some(ref v) = engine.embedder {
            config.embedder = v.clone();
        }
        if let Some(v) = engine.max_file_bytes {
            config.max_file_bytes = v;
        }
        if let Some(v) = engine.analyzer_threads {
            config.analyzer_threads = v;
        }
        if let Some(v) = engine.analyzer_timeout_ms {
            config.analyzer_timeout_ms = v;
        }
        if let Some(ref v) = engine.exclude {
            config.exclude = v.clone();
        }
    }
    if let Some(ref rules) = parsed.rules {
        for (rule_id, value) in rules {
            if let Some(ov) = parse_rule_override(value) {
                config.rules.insert(rule_id.clone(), ov);
            }
        }
    }
    if let Some(ref v) = parsed.search {
        config.search = v.clone();
    }
    if let Some(ref v) = parsed.memory {
        config.memory = v.clone();
    }
    if let Some(ref v) = parsed.fp {
        config.fp = v.clone();
    }
    if let Some(ref v) = parsed.gate {
        config.gate = v.clone();
    }
    if let Some(ref v) = parsed.sandbox {
        config.sandbox = v.clone();
    }
    if let Some(ref v) = parsed.pruning {
        config.pruning = v.clone();
    }
}

impl EngineConfig {
    /// Load configuration for a project using the 3-level resolution order,
    /// then apply environment overrides.
    ///
    /// First file found wins — later files are not consulted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a found config file cannot be read or parsed.
    pub fn load_from_project(root: &Path) -> std::result::Result<Self, ConfigError> {
        let mut config = Self::default();

        // 1. scrutiny.toml
        let scrutiny_toml = root.join("scrutiny.toml");
        if scrutiny_toml.is_file() {
            let content = std::fs::read_to_string(&scrutiny_toml).map_err(|e| {
                ConfigError::ReadError(scrutiny_toml.display().to_string(), e.to_string())
            })?;
            let parsed: TomlFile = toml::from_str(&content).map_err(|e| {
                ConfigError::ParseError(scrutiny_toml.display().to_string(), e.to_string())
            })?;
            apply_toml(&mut config, &parsed);
            config.apply_env_overrides();
            return Ok(config);
        }

        // 2. pyproject.toml [tool.scrutiny]
        let pyproject = root.join("pyproject.toml");
        if pyproject.is_file() {
            let content = std::fs::read_to_string(&pyproject).map_err(|e| {
                ConfigError::ReadError(pyproject.display().to_string(), e.to_string())
            })?;
            if let Ok(parsed) = toml::from_str::<PyprojectToml>(&content) {
                if let Some(tool) = parsed.tool {
                    if let Some(ref section) = tool.scrutiny {
                        apply_toml(&mut config, section);
                        config.apply_env_overrides();
                        return Ok(config);
                    }
                }
            }
        }

        // 3. Built-in defaults (already set)
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply the environment-variable overrides the external contract names.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SCRUTINY_STATE_DIR") {
            if !v.is_empty() {
                self.state_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("SCRUTINY_EMBEDDER") {
            if !v.is_empty() {
                self.embedder = v;
            }
        }
    }

    /// Whether an issue type is enabled, considering rule overrides.
    #[must_use]
    pub fn is_rule_enabled(&self, issue_type: &str) -> bool {
        match self.rules.get(issue_type) {
            Some(RuleOverride::Off) => false,
            _ => true,
        }
    }

    /// Effective severity for an issue type, considering rule overrides.
    #[must_use]
    pub fn effective_severity(&self, issue_type: &str, default: Severity) -> Severity {
        self.rules
            .get(issue_type)
            .and_then(|ov| ov.as_severity())
            .unwrap_or(default)
    }

    /// Compute a SHA-256 hash of the configuration for cache invalidation.
    ///
    /// Uses canonical JSON (sorted keys) so the hash is deterministic
    /// regardless of `HashMap` iteration order.
    #[must_use]
    pub fn config_hash(&self) -> String {
        use sha2::{Digest, Sha256};

        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let canonical = canonical_json(&value);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON for deterministic hashing
// ---------------------------------------------------------------------------

/// Produce a canonical JSON string with sorted object keys.
fn canonical_json(value: &serde_json::Value) -> String {
    let mut buf = String::new();
    write_canonical(value, &mut buf);
    buf
}

/// Recursively write a JSON value with sorted object keys.
fn write_canonical(value: &serde_json::Value, buf: &mut String) {
    use std::fmt::Write;

    match value {
        serde_json::Value::Null => buf.push_str("null"),
        serde_json::Value::Bool(b) => {
            let _ = write!(buf, "{b}");
        }
        serde_json::Value::Number(n) => {
            let _ = write!(buf, "{n}");
        }
        serde_json::Value::String(s) => {
            let _ = write!(buf, "{}", serde_json::to_string(s).unwrap_or_default());
        }
        serde_json::Value::Array(arr) => {
            buf.push('[');
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(v, buf);
            }
            buf.push(']');
        }
        serde_json::Value::Object(map) => {
            buf.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                let _ = write!(buf, "{}", serde_json::to_string(*k).unwrap_or_default());
                buf.push(':');
                write_canonical(&map[*k], buf);
            }
            buf.push('}');
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read config file '{0}': {1}")]
    ReadError(String, String),

    /// Failed to parse a configuration file.
    #[error("failed to parse config file '{0}': {1}")]
    ParseError(String, String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
