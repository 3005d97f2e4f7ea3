//! End-to-end routing scenarios against the in-memory graph

#[cfg(test)]
mod routing_scenarios;

#[cfg(test)]
mod recovery_scenarios;
