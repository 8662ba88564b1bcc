//! Command implementations.

pub mod restart;
pub mod send;
pub mod serve;

/// Build a multi-threaded runtime or exit.
pub(crate) fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => fail(&format!("Failed to create Tokio runtime: {e}")),
    }
}

/// Print `msg` to stderr and exit with status 1.
pub(crate) fn fail(msg: &str) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}
