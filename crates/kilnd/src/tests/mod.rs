//! Test suites for the kiln daemon.

mod socket_behaviour;
pub(crate) mod support;
