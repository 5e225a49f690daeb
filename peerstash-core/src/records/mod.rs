//! Record kinds replicated through the op log.

pub mod job;
pub mod location;

pub use job::{JobRecord, JobStatus};
pub use location::{LocationIndex, LocationRecord, ProblemReport, Replication};
