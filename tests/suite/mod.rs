//! Integration test suites.

#[cfg(unix)]
mod approval;
#[cfg(unix)]
mod pty;
#[cfg(unix)]
mod shell;
