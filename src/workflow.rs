//! Workflow and agent configuration.
//!
//! Reads `.conductor/workflows.yaml`, which declares one or more named
//! profiles. Each profile carries an ordered set of phases and a registry of
//! subagents:
//!
//! ```yaml
//! profiles:
//!   default:
//!     workflow:
//!       phases:
//!         planning:
//!           required: true
//!           consensus_required: true
//!           agents: [planner]
//!           retry: { max_attempts: 2, backoff_base_ms: 500, backoff_jitter_ms: 250 }
//!           timeout_seconds: 900
//!     subagents:
//!       planner:
//!         executor: subprocess
//!         command: ["scripts/planner.sh"]
//!         checkpoint_artifacts: ["docs/PRD.md"]
//! settings:
//!   max_parallel_agents: 4
//!   grace_period_secs: 5
//! ```
//!
//! Phase declaration order is execution order. Unknown keys are reported as
//! warnings, never errors; missing optional fields take the documented
//! defaults. Agent-level retry and timeout settings beat phase-level ones,
//! which beat the built-in defaults.

use crate::errors::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// How an agent is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Spawn the declared command as a child process.
    #[default]
    Subprocess,
    /// LLM-backed worker; invoked through its command like a subprocess.
    Llm,
    /// Cooperative hand-off to the operator's session (exit code 2).
    InSession,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Subprocess => write!(f, "subprocess"),
            ExecutorKind::Llm => write!(f, "llm"),
            ExecutorKind::InSession => write!(f, "in-session"),
        }
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subprocess" => Ok(ExecutorKind::Subprocess),
            "llm" => Ok(ExecutorKind::Llm),
            "in-session" => Ok(ExecutorKind::InSession),
            other => Err(ConductorError::Config(format!(
                "invalid executor kind '{other}'; valid values: subprocess, llm, in-session"
            ))),
        }
    }
}

/// Retry policy for agent invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay; doubles on each retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound for the jitter added to each delay.
    #[serde(default)]
    pub backoff_jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_base_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_jitter_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based count of completed
    /// attempts). Exponential in the base, plus a deterministic jitter
    /// derived from the attempt number so repeated runs stay reproducible.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let jitter = if self.backoff_jitter_ms == 0 {
            0
        } else {
            (u64::from(attempt).wrapping_mul(2654435761)) % self.backoff_jitter_ms
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// One phase declaration within a workflow profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Phase name; filled from the mapping key during load.
    #[serde(default, skip_deserializing)]
    pub name: String,
    /// Whether the run cannot complete without this phase.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Run the phase's agents concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Pause for operator consensus after the phase completes.
    #[serde(default)]
    pub consensus_required: bool,
    /// Agents to dispatch, in declared order.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Retry policy for agents that do not declare their own.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Timeout for agents that do not declare their own.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_required() -> bool {
    true
}

/// One agent declaration in the subagent registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent name; filled from the mapping key during load.
    #[serde(default, skip_deserializing)]
    pub name: String,
    #[serde(default)]
    pub executor: ExecutorKind,
    /// Program and arguments. Required for subprocess and llm executors.
    #[serde(default)]
    pub command: Vec<String>,
    /// Patterns that must match at least one file after a successful run.
    #[serde(default)]
    pub checkpoint_artifacts: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Extra environment variables passed to the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Free-form instructions handed to the operator for in-session agents.
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Global orchestrator settings shared by all profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Hard cap on concurrently in-flight agents.
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Seconds between SIGTERM and SIGKILL when cancelling a subprocess.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_max_parallel_agents() -> usize {
    4
}

fn default_grace_period_secs() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

/// A fully resolved workflow profile: ordered phases plus agent registry.
#[derive(Debug, Clone)]
pub struct WorkflowProfile {
    pub name: String,
    pub phases: Vec<PhaseConfig>,
    pub agents: HashMap<String, AgentConfig>,
}

impl WorkflowProfile {
    pub fn phase(&self, name: &str) -> Result<&PhaseConfig> {
        self.phases
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConductorError::UnknownPhase(name.to_string()))
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// The phase declared after `name`, or None if `name` is last.
    pub fn phase_after(&self, name: &str) -> Option<&PhaseConfig> {
        let idx = self.phase_index(name)?;
        self.phases.get(idx + 1)
    }

    pub fn first_phase(&self) -> Option<&PhaseConfig> {
        self.phases.first()
    }

    pub fn is_last_phase(&self, name: &str) -> bool {
        self.phase_index(name)
            .map(|i| i + 1 == self.phases.len())
            .unwrap_or(false)
    }

    pub fn agent(&self, name: &str) -> Result<&AgentConfig> {
        self.agents
            .get(name)
            .ok_or_else(|| ConductorError::UnknownAgent(name.to_string()))
    }

    /// Agent-level retry policy wins; phase-level applies only to agents
    /// without their own; otherwise the built-in default.
    pub fn effective_retry(&self, phase: &PhaseConfig, agent: &AgentConfig) -> RetryPolicy {
        agent
            .retry
            .or(phase.retry)
            .unwrap_or_default()
    }

    /// Same precedence as `effective_retry`, for timeouts.
    pub fn effective_timeout(&self, phase: &PhaseConfig, agent: &AgentConfig) -> Duration {
        let secs = agent
            .timeout_seconds
            .or(phase.timeout_seconds)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    /// Union of the phase's agents' checkpoint patterns, declared order,
    /// duplicates removed.
    pub fn checkpoint_patterns(&self, phase: &PhaseConfig) -> Vec<String> {
        let mut patterns = Vec::new();
        for agent_name in &phase.agents {
            if let Some(agent) = self.agents.get(agent_name) {
                for pattern in &agent.checkpoint_artifacts {
                    if !patterns.contains(pattern) {
                        patterns.push(pattern.clone());
                    }
                }
            }
        }
        patterns
    }
}

/// The parsed `workflows.yaml` document.
#[derive(Debug, Clone)]
pub struct WorkflowsFile {
    profiles: HashMap<String, WorkflowProfile>,
    pub settings: Settings,
}

impl WorkflowsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawWorkflowsFile = serde_yaml::from_str(content)
            .map_err(|e| ConductorError::Config(format!("invalid workflows.yaml: {e}")))?;
        warn_unknown_keys("workflows.yaml", &raw.extra);

        let mut profiles = HashMap::new();
        for (profile_name, raw_profile) in raw.profiles {
            profiles.insert(
                profile_name.clone(),
                resolve_profile(&profile_name, raw_profile)?,
            );
        }

        Ok(Self {
            profiles,
            settings: raw.settings,
        })
    }

    pub fn profile(&self, name: &str) -> Result<&WorkflowProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConductorError::UnknownProfile(name.to_string()))
    }

    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Deserialize)]
struct RawWorkflowsFile {
    #[serde(default)]
    profiles: HashMap<String, RawProfile>,
    #[serde(default)]
    settings: Settings,
    #[serde(flatten)]
    extra: Mapping,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    workflow: RawWorkflow,
    #[serde(default)]
    subagents: Mapping,
    #[serde(flatten)]
    extra: Mapping,
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    /// Kept as a raw mapping so declaration order survives deserialization.
    phases: Mapping,
    #[serde(flatten)]
    extra: Mapping,
}

fn resolve_profile(name: &str, raw: RawProfile) -> Result<WorkflowProfile> {
    warn_unknown_keys(&format!("profile '{name}'"), &raw.extra);
    warn_unknown_keys(&format!("profile '{name}' workflow"), &raw.workflow.extra);

    let mut phases = Vec::with_capacity(raw.workflow.phases.len());
    for (key, value) in raw.workflow.phases {
        let phase_name = yaml_key_to_string(&key, name)?;
        let mut phase: PhaseConfig = serde_yaml::from_value(value).map_err(|e| {
            ConductorError::Config(format!("profile '{name}' phase '{phase_name}': {e}"))
        })?;
        phase.name = phase_name;
        phases.push(phase);
    }

    if phases.is_empty() {
        return Err(ConductorError::Config(format!(
            "profile '{name}' declares no phases"
        )));
    }

    let mut agents = HashMap::with_capacity(raw.subagents.len());
    for (key, value) in raw.subagents {
        let agent_name = yaml_key_to_string(&key, name)?;
        let mut agent: AgentConfig = serde_yaml::from_value(value).map_err(|e| {
            ConductorError::Config(format!("profile '{name}' agent '{agent_name}': {e}"))
        })?;
        agent.name = agent_name.clone();
        agents.insert(agent_name, agent);
    }

    // Every referenced agent must exist, except the built-in hygiene phase
    // which runs without a registry entry.
    for phase in &phases {
        for agent_name in &phase.agents {
            if !agents.contains_key(agent_name) && agent_name != crate::hygiene::HYGIENE_AGENT {
                return Err(ConductorError::Config(format!(
                    "profile '{name}' phase '{}' references undeclared agent '{agent_name}'",
                    phase.name
                )));
            }
        }
    }

    Ok(WorkflowProfile {
        name: name.to_string(),
        phases,
        agents,
    })
}

fn yaml_key_to_string(key: &serde_yaml::Value, profile: &str) -> Result<String> {
    key.as_str().map(str::to_string).ok_or_else(|| {
        ConductorError::Config(format!("profile '{profile}' has a non-string mapping key"))
    })
}

fn warn_unknown_keys(context: &str, extra: &Mapping) {
    for key in extra.keys() {
        if let Some(key) = key.as_str() {
            tracing::warn!(context, key, "ignoring unknown configuration key");
        }
    }
}

/// Starter configuration written by `conductor init`.
pub const STARTER_WORKFLOWS: &str = r#"# Conductor workflow configuration.
# Phase declaration order is execution order.
profiles:
  default:
    workflow:
      phases:
        planning:
          required: true
          consensus_required: true
          agents: [planner]
          timeout_seconds: 900
        development:
          required: true
          agents: [developer]
          retry: { max_attempts: 2, backoff_base_ms: 1000, backoff_jitter_ms: 500 }
        qa:
          required: true
          agents: [tester]
        repo-hygiene:
          required: false
          agents: [repo-hygiene]
        documentation:
          required: false
          agents: [writer]
    subagents:
      planner:
        executor: subprocess
        command: ["scripts/planner.sh"]
        checkpoint_artifacts: ["docs/PRD.md"]
      developer:
        executor: subprocess
        command: ["scripts/developer.sh"]
        checkpoint_artifacts: ["artifacts/development/*.md"]
      tester:
        executor: subprocess
        command: ["scripts/tester.sh"]
        checkpoint_artifacts: ["artifacts/qa/test_report.md"]
      writer:
        executor: in-session
        checkpoint_artifacts: ["docs/README.md"]
        instructions: |
          Write user-facing documentation for the work completed so far,
          then run `conductor checkpoint` to validate and advance.
settings:
  max_parallel_agents: 4
  grace_period_secs: 5
"#;
