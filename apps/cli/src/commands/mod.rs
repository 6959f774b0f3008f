//! Subcommand implementations.

pub mod dispatch;
pub mod runs;
pub mod select;
pub mod signature;

/// Process exit codes.
pub mod exit {
    pub const SUCCESS: u8 = 0;
    /// At least one manifest could not be loaded.
    pub const MANIFEST_INVALID: u8 = 1;
    /// Every manifest loaded but at least one job failed.
    pub const JOB_FAILED: u8 = 2;
}
