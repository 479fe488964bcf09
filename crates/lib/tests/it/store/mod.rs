//! Store integration tests
//!
//! Stores run against the in-memory volatile driver, a call-recording
//! wrapper around it, or a scripted driver the test drives by hand.

mod backing_store;
mod direct_store;
mod reference_mode;
