pub mod constants;
pub mod maintenance;
pub mod node;
pub mod telemetry;
