//! Routing policy engine for multi-port audio sinks
//!
//! Decides which sink ports each new stereo stream is linked to and keeps
//! the graph's links converged with that decision.

pub mod domain;
