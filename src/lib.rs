pub mod ble;
pub mod link;
pub mod scales;
pub mod session;
pub mod system;
pub mod types;

pub use session::ScaleSession;
pub use types::*;
