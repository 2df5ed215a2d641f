pub mod policy;

pub use policy::{CheckInput, SafetyDecision, SecurityPolicy, Tier, ToolSource};
