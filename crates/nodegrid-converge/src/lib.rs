//! nodegrid-converge — the convergence loop.
//!
//! A single task ticks on a fixed interval, compares the latest
//! [`ClusterSnapshot`](nodegrid_lifecycle::ClusterSnapshot) against the
//! desired [`ClusterSpec`](nodegrid_core::ClusterSpec), and asks the
//! lifecycle controller to start or stop nodes. It never mutates node
//! state itself.

pub mod clock;
pub mod reconciler;

pub use clock::TickClock;
pub use reconciler::{Decision, ReconcileAction, Reconciler, plan};
