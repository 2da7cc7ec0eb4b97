/// Command execution behind the agent capability boundary.
///
/// - `execute_bash`: runs one shell command with a deadline and kills its
///   process group afterwards.
/// - `capability`: policy gate, global concurrency limit and invocation
///   records in front of the executor.
pub mod capability;
pub mod execute_bash;

pub use capability::{Capability, InvocationRecorder, PendingInvocation, ToolRequest};
pub use execute_bash::{CommandExecutor, EchoExecutor, ExecError, ExecOutput, ExecRequest, ShellExecutor};
