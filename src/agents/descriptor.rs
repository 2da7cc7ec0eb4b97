use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cli::Provider;
use crate::config::AgentFileConfig;

pub const SYNTHESIS_AGENT: &str = "synthesis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Planning,
    Research,
    Generation,
    Decision,
    Review,
    Synthesis,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Planning => "planning",
            AgentKind::Research => "research",
            AgentKind::Generation => "generation",
            AgentKind::Decision => "decision",
            AgentKind::Review => "review",
            AgentKind::Synthesis => "synthesis",
        }
    }

    fn default_executor(self) -> bool {
        matches!(self, AgentKind::Research)
    }

    fn default_priority(self) -> i32 {
        match self {
            AgentKind::Planning => 10,
            AgentKind::Research => 20,
            AgentKind::Generation | AgentKind::Decision => 30,
            AgentKind::Review => 40,
            AgentKind::Synthesis => 100,
        }
    }

    fn default_description(self) -> &'static str {
        match self {
            AgentKind::Planning => "Breaks the request into objectives and an approach",
            AgentKind::Research => "Gathers facts from the environment with read-only commands",
            AgentKind::Generation => "Produces the requested artifact from plan and findings",
            AgentKind::Decision => "Weighs findings and issues a recommendation",
            AgentKind::Review => "Checks earlier output for gaps and errors",
            AgentKind::Synthesis => "Merges the run into the final markdown answer",
        }
    }

    pub fn default_system_prompt(self) -> &'static str {
        match self {
            AgentKind::Planning => {
                "You are the planning agent.\n\
                 Break the request into concrete objectives, constraints and an ordered approach. \
                 Keep it short and actionable."
            }
            AgentKind::Research => {
                "You are the research agent.\n\
                 Investigate the environment before answering. To run shell commands reply with \
                 a JSON block {\"commands\":[{\"command\":\"...\",\"cwd\":\"optional\",\"timeout_secs\":30}]} \
                 and nothing else. Prefer read-only commands. When you have enough evidence, reply \
                 with your findings in plain text without a JSON block."
            }
            AgentKind::Generation => {
                "You are the generation agent.\n\
                 Produce the requested artifact using the plan and research findings so far. \
                 Do not invent facts the research did not establish."
            }
            AgentKind::Decision => {
                "You are the decision agent.\n\
                 Weigh the research findings against the request and state a clear recommendation \
                 with its rationale. If the request should not proceed at all, add a final line \
                 `SKIP_DOWNSTREAM: <reason>`."
            }
            AgentKind::Review => {
                "You are the review agent.\n\
                 Review the earlier steps for errors, gaps and risks. List concrete issues with \
                 their severity, then end with a single line `APPROVED: yes` when nothing \
                 critical remains or `APPROVED: no` otherwise."
            }
            AgentKind::Synthesis => {
                "You are the synthesis agent.\n\
                 Merge the run into one markdown answer for the user. Report what succeeded, \
                 flag every step marked failed or timed_out, and never claim a failed step \
                 produced a result."
            }
        }
    }
}

/// Built-in agents that reuse a kind under their own name.
struct Specialist {
    name: &'static str,
    kind: AgentKind,
    priority: i32,
    executor: bool,
    description: &'static str,
    system_prompt: &'static str,
}

const CODE_AGENT_TOOLS: &str = "To run shell commands reply with a JSON block \
     {\"commands\":[{\"command\":\"...\",\"cwd\":\"optional\",\"timeout_secs\":30}]} and nothing else. \
     When the work is done, reply with a summary of the changes without a JSON block.";

const SPECIALISTS: [Specialist; 4] = [
    Specialist {
        name: "backend",
        kind: AgentKind::Generation,
        priority: 31,
        executor: true,
        description: "Writes and changes backend services, APIs and database code",
        system_prompt: "You are the backend code agent.\n\
             Write or change backend code (services, APIs, database access) following the plan \
             and research findings. Handle errors explicitly and keep changes minimal.",
    },
    Specialist {
        name: "frontend",
        kind: AgentKind::Generation,
        priority: 32,
        executor: true,
        description: "Writes and changes user-facing frontend code",
        system_prompt: "You are the frontend code agent.\n\
             Write or change frontend code (components, styles, client state) following the \
             plan and research findings.",
    },
    Specialist {
        name: "infrastructure",
        kind: AgentKind::Generation,
        priority: 33,
        executor: true,
        description: "Writes deployment manifests, pipelines and cluster configuration",
        system_prompt: "You are the infrastructure code agent.\n\
             Write or change deployment manifests, CI pipelines and cluster configuration. \
             Validate manifests before reporting them done.",
    },
    Specialist {
        name: "recommendation",
        kind: AgentKind::Generation,
        priority: 35,
        executor: false,
        description: "Turns an approved decision into an implementation guide",
        system_prompt: "You are the recommendation agent.\n\
             Turn the decision and research findings into a step-by-step implementation guide \
             another engineer could follow: prerequisites, directory layout, files to create \
             with their contents, and verification commands.",
    },
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolFailurePolicy {
    /// Record the failed invocation, feed it back to the model and keep going.
    #[default]
    Continue,
    /// Stop the step at the first failed invocation.
    Abort,
}

/// Static description of one agent. Built once at startup and shared
/// read-only by every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub kind: AgentKind,
    pub description: String,
    pub executor: bool,
    pub priority: i32,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_tool_rounds: Option<u32>,
    pub tool_failure: ToolFailurePolicy,
    #[serde(skip)]
    pub system_prompt: String,
}

impl AgentDescriptor {
    pub fn builtin(kind: AgentKind) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            description: kind.default_description().to_string(),
            executor: kind.default_executor(),
            priority: kind.default_priority(),
            provider: None,
            model: None,
            timeout_secs: None,
            max_tool_rounds: None,
            tool_failure: ToolFailurePolicy::Continue,
            system_prompt: kind.default_system_prompt().to_string(),
        }
    }

    fn specialist(spec: &Specialist) -> Self {
        let system_prompt = if spec.executor {
            format!("{} {}", spec.system_prompt, CODE_AGENT_TOOLS)
        } else {
            spec.system_prompt.to_string()
        };
        Self {
            name: spec.name.to_string(),
            description: spec.description.to_string(),
            executor: spec.executor,
            priority: spec.priority,
            system_prompt,
            ..Self::builtin(spec.kind)
        }
    }

    fn apply(&mut self, overrides: &AgentFileConfig) {
        if let Some(kind) = overrides.kind {
            self.kind = kind;
        }
        if let Some(description) = &overrides.description {
            self.description = description.clone();
        }
        if let Some(executor) = overrides.executor {
            self.executor = executor;
        }
        if let Some(priority) = overrides.priority {
            self.priority = priority;
        }
        if overrides.provider.is_some() {
            self.provider = overrides.provider;
        }
        if overrides.model.is_some() {
            self.model = overrides.model.clone();
        }
        if let Some(timeout) = overrides.timeout_secs {
            self.timeout_secs = Some(timeout.max(1));
        }
        if let Some(rounds) = overrides.max_tool_rounds {
            self.max_tool_rounds = Some(rounds.max(1));
        }
        if let Some(policy) = overrides.tool_failure {
            self.tool_failure = policy;
        }
        if let Some(prompt) = &overrides.system_prompt {
            self.system_prompt = prompt.clone();
        }
    }

    pub fn is_pure(&self) -> bool {
        !self.executor
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorTable {
    descriptors: BTreeMap<String, Arc<AgentDescriptor>>,
}

impl DescriptorTable {
    pub fn builtin() -> Self {
        let descriptors = [
            AgentKind::Planning,
            AgentKind::Research,
            AgentKind::Generation,
            AgentKind::Decision,
            AgentKind::Review,
            AgentKind::Synthesis,
        ]
        .into_iter()
        .map(AgentDescriptor::builtin)
        .chain(SPECIALISTS.iter().map(AgentDescriptor::specialist))
        .map(|descriptor| (descriptor.name.clone(), Arc::new(descriptor)))
        .collect();
        Self { descriptors }
    }

    /// Built-in agents overlaid with `[agents.<name>]` tables. Unknown names
    /// register new agents and must then declare a `kind`.
    pub fn from_config(agents: &HashMap<String, AgentFileConfig>) -> Result<Self> {
        let mut table = Self::builtin();

        let mut names = agents.keys().cloned().collect::<Vec<String>>();
        names.sort();
        for name in names {
            let overrides = &agents[&name];
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err(anyhow::anyhow!("[agents] table names cannot be empty"));
            }

            let mut descriptor = match table.descriptors.get(trimmed) {
                Some(existing) => existing.as_ref().clone(),
                None => {
                    let kind = overrides.kind.ok_or_else(|| {
                        anyhow::anyhow!(
                            "[agents.{trimmed}] is not a built-in agent and must set kind"
                        )
                    })?;
                    let mut descriptor = AgentDescriptor::builtin(kind);
                    descriptor.name = trimmed.to_string();
                    descriptor
                }
            };
            descriptor.apply(overrides);

            if descriptor.kind == AgentKind::Synthesis && descriptor.executor {
                return Err(anyhow::anyhow!(
                    "[agents.{trimmed}] is a synthesis agent and cannot enable the executor"
                ));
            }

            table
                .descriptors
                .insert(trimmed.to_string(), Arc::new(descriptor));
        }

        Ok(table)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentDescriptor>> {
        self.descriptors.get(name).cloned()
    }

    pub fn synthesis(&self) -> Arc<AgentDescriptor> {
        self.get(SYNTHESIS_AGENT)
            .unwrap_or_else(|| Arc::new(AgentDescriptor::builtin(AgentKind::Synthesis)))
    }

    /// All descriptors ordered by priority, then name.
    pub fn all(&self) -> Vec<Arc<AgentDescriptor>> {
        let mut all = self.descriptors.values().cloned().collect::<Vec<_>>();
        all.sort_by_key(|d| d.priority);
        all
    }

    /// Resolve a plan template into descriptors. The result is stably sorted
    /// by priority, so agents of equal priority keep their template order.
    pub fn resolve_plan(&self, names: &[String]) -> Result<Vec<Arc<AgentDescriptor>>> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let descriptor = self
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("unknown agent '{name}' in [plans]"))?;
            if descriptor.kind == AgentKind::Synthesis {
                return Err(anyhow::anyhow!(
                    "synthesis agent '{name}' cannot appear in [plans]; it always runs last"
                ));
            }
            if resolved
                .iter()
                .any(|d: &Arc<AgentDescriptor>| d.name == descriptor.name)
            {
                continue;
            }
            resolved.push(descriptor);
        }

        if resolved.is_empty() {
            return Err(anyhow::anyhow!("[plans] entries must name at least one agent"));
        }

        resolved.sort_by_key(|d| d.priority);
        Ok(resolved)
    }
}
