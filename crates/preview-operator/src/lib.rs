//! Preview operator - runs the PreviewEnvironment controller and TTL cleanup

pub mod controller_runner;
pub mod settings;
pub mod startup;
