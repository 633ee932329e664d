//! Output plumbing shared by a composition's tasks: the timer, the failure/cancellation state and
//! the pull-controlled byte stream.

pub mod byte_stream;
pub mod scheduler;
pub mod supervisor;

pub use byte_stream::ByteStream;
pub use scheduler::{Subscription, TickScheduler};
pub use supervisor::Supervisor;
