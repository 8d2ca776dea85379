//! rendiff harness
//!
//! Renders the same visualization spec through a candidate backend and one
//! or more reference backends in a real browser, scores the pixel
//! difference, and gates each case on its own tolerance.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Session                                                    │
//! │    ├── FailureArtifactWriter::reset()                       │
//! │    ├── DevServer::start() -> http://localhost:<port>/       │
//! │    │     └── allocate_port()                                │
//! │    ├── for case in CaseMatrix                               │
//! │    │     └── CaseRunner::run(case)                          │
//! │    │           ├── SpecDocument::from_file                  │
//! │    │           ├── RenderCapture::capture(candidate)        │
//! │    │           ├── RenderCapture::capture(reference..)      │
//! │    │           ├── ImageComparator::compare                 │
//! │    │           └── score <= tolerance ? pass : persist      │
//! │    └── DevServer::shutdown()                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifacts;
pub mod capture;
pub mod config;
pub mod error;
pub mod port;
pub mod runner;
pub mod server;

pub use artifacts::FailureArtifactWriter;
pub use capture::{PageDriver, PlaywrightDriver, RenderCapture};
pub use config::HarnessConfig;
pub use error::{CaptureError, HarnessError, HarnessResult, SetupError};
pub use runner::{CaseOutcome, CaseReport, CaseRunner, Session, SuiteReport};
pub use server::DevServer;

#[cfg(all(test, unix))]
pub(crate) mod testing {
    use std::time::{Duration, Instant};

    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    /// True while `pid` exists and is not a zombie awaiting its reaper
    pub fn is_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // State letter follows the parenthesised command name
            Ok(stat) => stat
                .rsplit_once(')')
                .map_or(true, |(_, rest)| !rest.trim_start().starts_with('Z')),
            Err(_) => kill(Pid::from_raw(pid), None).is_ok(),
        }
    }

    /// Poll until `pid` is gone; false if it is still running at `timeout`
    pub fn wait_until_gone(pid: i32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while is_running(pid) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        true
    }
}
