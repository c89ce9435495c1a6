//! Crate error type plus context helpers.
//!
//! Subprocess exit codes are never turned into errors here; a failing
//! command is data carried by [`crate::backup::process::ProcessResult`].

use std::fmt::Debug;
pub mod error;
pub mod result;

/// Attach the object being worked on and the failing function path.
pub trait WithDebugObjectAndFnName<S: Into<String>, O: Debug + 'static> {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self;
}

/// Prefix an error with a human readable message.
pub trait WithMsg<S: Into<String>> {
    fn with_msg(self, msg: S) -> Self;
}
