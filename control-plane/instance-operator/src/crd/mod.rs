pub mod instance;
pub mod run;

pub const API_VERSION: &str = "agents.dev/v1alpha1";
