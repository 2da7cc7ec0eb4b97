/// Multi-agent pipeline.
///
/// A request is routed to an ordered plan of agents, each agent appends one
/// step to the run state, and the synthesizer renders the final artifact:
///
/// - `descriptor`: declarative agent table (built-ins plus config)
/// - `router`: intent classification and plan selection
/// - `agent`: the model-backed agent and its tool-round loop
/// - `pipeline`: the driver (deadlines, retries, skip, cancellation)
/// - `synthesizer`: final artifact
/// - `state`: request, steps and tool invocation records
pub mod agent;
pub mod descriptor;
pub mod pipeline;
pub mod router;
pub mod state;
pub mod synthesizer;

pub use agent::{Agent, ModelAgent, StepContext};
pub use descriptor::{AgentDescriptor, AgentKind, DescriptorTable, ToolFailurePolicy};
pub use pipeline::{Pipeline, ProgressEvent, RunOutcome};
pub use router::{Intent, PipelinePlan, Router};
pub use state::{Request, RunState, RunTermination, Step, StepStatus, ToolInvocation, ToolOutcome};
pub use synthesizer::Synthesizer;
