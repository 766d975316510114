//! Test utilities for QueryCache integration tests
//!
//! TestFixture wires a gateway to a manual clock and a counting upstream so
//! tests can drive expiry and coalescing deterministically.

pub mod test_fixture;
