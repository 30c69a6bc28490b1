//! Step definitions for cucumber scenarios.

mod recovery_steps;
