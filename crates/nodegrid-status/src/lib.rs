//! nodegrid-status — what is running, and where.
//!
//! [`StatusReporter`] reads the latest published snapshot (it never waits
//! on a lifecycle operation) and projects it into [`EndpointRow`]s. The
//! report is flagged `stale` when the convergence loop has not ticked
//! within two intervals.

pub mod report;

pub use report::{EndpointRow, StatusReport, StatusReporter};
