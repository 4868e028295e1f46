// HTTP routes
pub mod health;
pub mod overview;
pub mod steward;
pub mod tasks;

pub use health::*;
pub use overview::*;
pub use steward::*;
pub use tasks::*;
