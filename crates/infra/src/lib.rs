//! Infrastructure for patchbay: concrete graph collaborators

pub mod graph;
