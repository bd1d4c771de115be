pub mod config;
pub mod diagnostics;
pub mod events;

pub use config::*;
pub use diagnostics::*;
pub use events::*;
