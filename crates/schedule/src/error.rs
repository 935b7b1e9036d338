// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScheduleError>;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid preservation params: {0}")]
    InvalidParams(String),

    /// The resolver produced a keep set that violates its own invariants.
    /// This is a bug signal, not a runtime condition; the run must stop
    /// before any action executes.
    #[error("resolver inconsistency: {0}")]
    ResolverInconsistency(String),

    /// Plan validation failed: replaying the plan does not reproduce the
    /// keep set, or an action depends on state that does not exist yet.
    #[error("planner assertion: {0}")]
    PlannerAssertion(String),
}
