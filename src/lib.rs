pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod models;
pub mod mutation;
pub mod report;
pub mod scheduler;
pub mod source;
pub mod stats;

pub use engine::RosterEngine;
pub use error::{MutationError, SchedulerError, SourceError};
pub use models::{RosterSnapshot, StatisticsResult, Student, StudentId, StudentSummary};
pub use mutation::{Mutation, MutationTicket};
pub use source::DataSource;
