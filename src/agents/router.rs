use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::descriptor::{AgentDescriptor, DescriptorTable};
use super::state::{Request, Routing};
use crate::config::PlansConfig;
use crate::error::PipelineError;
use crate::provider::{ContextMessage, ModelProvider};

const ROUTER_PROMPT: &str = "You are the router of a multi-agent pipeline.\n\
Classify the user's request into exactly one intent:\n\
- build: produce or change an artifact (code, manifests, configuration)\n\
- analyze: inspect and explain an existing system\n\
- decide: recommend whether to adopt, keep or change something\n\
- query: answer a direct factual question about the environment\n\
Reply with a single line `INTENT: <build|analyze|decide|query>`.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Build,
    Analyze,
    Decide,
    Query,
}

impl Intent {
    pub const ALL: [Intent; 4] = [Intent::Build, Intent::Analyze, Intent::Decide, Intent::Query];

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Build => "build",
            Intent::Analyze => "analyze",
            Intent::Decide => "decide",
            Intent::Query => "query",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphabetic())
            .to_ascii_lowercase();
        Self::ALL.into_iter().find(|i| i.as_str() == label)
    }

    fn builtin_template(self) -> &'static [&'static str] {
        match self {
            Intent::Query => &["research"],
            Intent::Analyze => &["planning", "research", "review"],
            Intent::Decide => &["planning", "research", "decision"],
            Intent::Build => &["planning", "research", "generation", "review"],
        }
    }
}

/// Ordered agents for one run. Fixed once routing returns.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub agents: Vec<Arc<AgentDescriptor>>,
    pub routing: Routing,
}

impl PipelinePlan {
    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|d| d.name.clone()).collect()
    }
}

pub struct Router {
    provider: Arc<dyn ModelProvider>,
    default_plan: Vec<Arc<AgentDescriptor>>,
    plans: HashMap<Intent, Vec<Arc<AgentDescriptor>>>,
}

impl Router {
    /// Resolves every template up front so a bad `[plans]` entry fails at
    /// startup rather than mid-run.
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        table: &DescriptorTable,
        plans: &PlansConfig,
    ) -> Result<Self> {
        let default_plan = table
            .resolve_plan(&plans.default)
            .context("invalid [plans].default")?;

        let mut resolved = HashMap::new();
        for intent in Intent::ALL {
            let configured = match intent {
                Intent::Build => plans.build.clone(),
                Intent::Analyze => plans.analyze.clone(),
                Intent::Decide => plans.decide.clone(),
                Intent::Query => plans.query.clone(),
            };
            let names = configured.unwrap_or_else(|| {
                intent
                    .builtin_template()
                    .iter()
                    .map(|n| n.to_string())
                    .collect()
            });
            let agents = table
                .resolve_plan(&names)
                .with_context(|| format!("invalid [plans].{}", intent.as_str()))?;
            resolved.insert(intent, agents);
        }

        Ok(Self {
            provider,
            default_plan,
            plans: resolved,
        })
    }

    pub fn plan_for(&self, intent: Option<Intent>) -> &[Arc<AgentDescriptor>] {
        intent
            .and_then(|i| self.plans.get(&i))
            .map(Vec::as_slice)
            .unwrap_or(&self.default_plan)
    }

    /// Always returns a non-empty plan. Any routing failure selects the
    /// default plan and is recorded in the returned routing info.
    pub async fn route(&self, request: &Request, timeout: Duration) -> PipelinePlan {
        if let Some(intent) = explicit_intent(&request.input) {
            return self.plan(Some(intent), false, Some("explicit intent prefix".to_string()));
        }

        let context = [ContextMessage::user(request.input.clone())];
        let reply = tokio::time::timeout(timeout, self.provider.invoke(ROUTER_PROMPT, &context)).await;

        let failure = match reply {
            Ok(Ok(text)) => match parse_intent_reply(&text) {
                Some(intent) => return self.plan(Some(intent), false, None),
                None => PipelineError::RoutingAmbiguous(format!(
                    "unrecognized label in '{}'",
                    text.lines().next().unwrap_or_default().trim()
                )),
            },
            Ok(Err(err)) => PipelineError::RoutingAmbiguous(err.to_string()),
            Err(_) => PipelineError::RoutingAmbiguous(format!(
                "router timed out after {}s",
                timeout.as_secs()
            )),
        };

        tracing::warn!(error = %failure, "routing fell back to the default plan");
        self.plan(None, true, Some(failure.to_string()))
    }

    fn plan(&self, intent: Option<Intent>, fallback: bool, reason: Option<String>) -> PipelinePlan {
        PipelinePlan {
            agents: self.plan_for(intent).to_vec(),
            routing: Routing {
                intent: intent.map(|i| i.as_str().to_string()),
                fallback,
                reason,
            },
        }
    }
}

/// `decide: adopt X` style prefixes skip the routing call.
pub fn explicit_intent(input: &str) -> Option<Intent> {
    let (head, rest) = input.trim().split_once(':')?;
    if head.contains(char::is_whitespace) || rest.trim().is_empty() {
        return None;
    }
    Intent::from_label(head)
}

pub fn parse_intent_reply(reply: &str) -> Option<Intent> {
    for line in reply.lines() {
        let trimmed = line.trim();
        if let Some(head) = trimmed.get(..7)
            && head.eq_ignore_ascii_case("intent:")
        {
            return Intent::from_label(&trimmed[7..]);
        }
    }
    let single = reply.trim();
    if single.lines().count() == 1 {
        return Intent::from_label(single);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_intent_line_case_insensitively() {
        assert_eq!(parse_intent_reply("INTENT: decide"), Some(Intent::Decide));
        assert_eq!(parse_intent_reply("thinking...\nintent: **Build**"), Some(Intent::Build));
        assert_eq!(parse_intent_reply("query"), Some(Intent::Query));
        assert_eq!(parse_intent_reply("INTENT: deploy"), None);
        assert_eq!(parse_intent_reply("I think\nit is a build"), None);
    }

    #[test]
    fn explicit_prefix_requires_known_label_and_body() {
        assert_eq!(explicit_intent("decide: adopt component X"), Some(Intent::Decide));
        assert_eq!(explicit_intent("Analyze: storage"), Some(Intent::Analyze));
        assert_eq!(explicit_intent("deploy: thing"), None);
        assert_eq!(explicit_intent("decide:"), None);
        assert_eq!(explicit_intent("please decide: x"), None);
    }
}
