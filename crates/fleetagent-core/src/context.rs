use std::sync::Arc;

use fleetagent_bus::Transport;
use fleetagent_scheduler::{AgentBinary, TaskStore};

use crate::{AgentConfig, ControllerClient, GuardSet, HostOps, LifecycleController};

/// Everything a command handler may touch, shared across handlers.
pub struct AgentContext {
    pub config: AgentConfig,
    pub transport: Arc<dyn Transport>,
    pub guards: GuardSet,
    pub tasks: TaskStore,
    pub host: Arc<dyn HostOps>,
    pub controller: ControllerClient,
    pub lifecycle: LifecycleController,
    /// The running agent binary, used to re-invoke one-shot modes.
    pub agent: AgentBinary,
}

impl AgentContext {
    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }
}
