//! How the agent ends the host process.

/// The process-ending side effect, behind a trait so exit paths can be
/// exercised without killing the test runner.
pub trait HostRuntime: Send + Sync {
    /// End the process with `code`. [`ProcessHost`] never returns.
    fn terminate(&self, code: i32);
}

/// Terminates through [`std::process::exit`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHost;

impl HostRuntime for ProcessHost {
    fn terminate(&self, code: i32) {
        log::debug!("Exiting with code {code}");
        std::process::exit(code);
    }
}
