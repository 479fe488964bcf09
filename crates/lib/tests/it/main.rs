/*! Integration tests for convergent.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - crdt: convergence properties and cross-model scenarios for the CRDT models
 * - store: DirectStore, BackingStore and ReferenceModeStore behavior against
 *   in-memory and scripted drivers
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("convergent=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod crdt;
mod helpers;
mod store;
