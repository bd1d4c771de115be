pub mod machine;
pub mod manager;
pub mod readiness;

pub use machine::{ConnectionState, LinkInput, LinkStateMachine, LinkStats};
pub use manager::*;
pub use readiness::Readiness;
