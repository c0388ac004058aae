//! Process exit codes of `runlogged` itself.
//!
//! The command's own exit code is passed through unless `--indicate-success`
//! is given. The codes below are reserved for runs where the command did not
//! finish or never started.

use kiroku::Outcome;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;

pub const ABORTED: i32 = 250;
pub const CLI_ERROR: i32 = 251;
pub const LOG_OPEN_FAILED: i32 = 252;
pub const START_FAILED: i32 = 253;
pub const INTERNAL: i32 = 254;

pub fn for_outcome(outcome: &Outcome, indicate_success: bool) -> i32 {
	match outcome {
		Outcome::Aborted { .. } => ABORTED,
		Outcome::Success { .. } if indicate_success => SUCCESS,
		Outcome::Failure { .. } if indicate_success => FAILURE,
		Outcome::Success { exit_code } | Outcome::Failure { exit_code } => *exit_code,
	}
}
