//! Evaluation: trajectory tracking during turns, session and case reports afterwards.

mod metrics;
mod trajectory;

pub use metrics::{Evaluator, MissedKeys, QuestionQuality, SessionMetrics, SessionReport};
pub use trajectory::{CaseTrajectoryReport, TrajectoryAggregate, TrajectoryProgress, TrajectoryTracker};
