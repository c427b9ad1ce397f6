//! # Relay Test Suite
//!
//! Unified test crate for scenarios that span the broker adapter, the
//! correlation engine and the worker pool.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── src/integration/    # Cross-crate request/reply scenarios
//! │   ├── request_reply.rs
//! │   ├── failures.rs
//! │   └── scaling.rs
//! └── benches/            # Criterion benchmarks
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p relay-tests
//!
//! # By category
//! cargo test -p relay-tests integration::failures::
//!
//! # Benchmarks
//! cargo bench -p relay-tests
//! ```

pub mod integration;
