pub mod broker;
pub mod handler;
pub mod store;

pub use broker::*;
pub use handler::*;
pub use store::*;
