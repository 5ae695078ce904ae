pub mod redis_store;
pub mod reply;
pub mod state_machine;
pub mod store;

pub use redis_store::*;
pub use reply::*;
pub use state_machine::*;
pub use store::*;
