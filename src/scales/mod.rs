pub mod chipsea;
pub mod detectors;
pub mod felicita;
pub mod stability;
pub mod traits;

pub use chipsea::ChipseaProtocol;
pub use felicita::FelicitaProtocol;
pub use stability::*;
pub use traits::*;
