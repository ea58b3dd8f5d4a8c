pub mod mock_queue;

/// Installs `env_logger` for diagnostic output (`RUST_LOG=debug cargo
/// test -- --nocapture`). Idempotent across the many test binaries in
/// this crate that call it.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
