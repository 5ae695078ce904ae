pub mod calendar;
pub mod coordinator;
pub mod escalation;
pub mod messaging;
pub mod reaper;
pub mod templates;

pub use calendar::*;
pub use coordinator::*;
pub use escalation::*;
pub use messaging::*;
pub use reaper::*;
