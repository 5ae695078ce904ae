pub mod reconciler;
pub mod window;

pub use reconciler::*;
pub use window::*;
