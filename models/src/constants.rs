pub const NODIFY: &str = "nodify";

// Component names, used for tracing.
pub const AGENT: &str = "nodify-agent";
pub const CONTROLLER: &str = "nodify-controller";

// Node condition constants
pub const MAINTENANCE_CONDITION_TYPE: &str = "MaintenanceScheduled";
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const NO_MAINTENANCE_REASON: &str = "None";
pub const NO_MAINTENANCE_MESSAGE: &str = "No maintenance scheduled.";

// Node Events are recorded in the `default` namespace, as the kubelet does.
pub const NODE_EVENT_NAMESPACE: &str = "default";
pub const NODE_EVENT_SOURCE: &str = NODIFY;

// Process environment
pub const NODE_NAME_ENV_VAR: &str = "NODE_NAME";
pub const TERMINATION_LOG_ENV_VAR: &str = "TERMINATION_LOG";
pub const DEFAULT_TERMINATION_LOG: &str = "/dev/termination-log";
