//! Services - coordination and business logic
//!
//! This module contains the core logic of the bridge:
//! - `arbiter` - serial link ownership and poller preemption
//! - `poller` - periodic sensor polling over the roster
//! - `dispatcher` - cloud command routing and response publication
//! - `gateway` - gateway enrollment lifecycle
//! - `node` - node enroll/unenroll/relay operations

pub mod arbiter;
pub mod dispatcher;
pub mod gateway;
pub mod node;
pub mod poller;

// Re-export commonly used types
pub use arbiter::Arbiter;
pub use dispatcher::CommandDispatcher;
pub use gateway::GatewayController;
pub use node::NodeController;
pub use poller::NodePoller;
