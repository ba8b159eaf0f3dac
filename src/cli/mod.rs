//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Output formatting for ports, discovery reports and reply bodies

pub mod exit_codes;
pub mod output;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes, ToExitCode};
pub use output::{format_body, format_report, OutputFormat};
