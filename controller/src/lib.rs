pub mod config;
pub mod error;
pub mod reconciler;

pub use crate::reconciler::{error_policy, reconcile, Context};
