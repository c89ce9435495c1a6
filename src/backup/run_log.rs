//! In-memory report text and attachments for one job run.

use crate::backup::process::ProcessResult;
use crate::backup::text::{cap_bytes, exceeds, shorten, MAX_ATTACHMENT_BYTES};
use indexmap::IndexMap;

/// Attachment file name to full text payload.
pub type Attachments = IndexMap<String, String>;

/// Append-only report buffer, flushed to the notifier at checkpoints.
#[derive(Debug, Default, Clone)]
pub struct RunLog {
    text: String,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text`, mirroring it to stdout when `echo` is set.
    pub fn add<S: AsRef<str>>(&mut self, text: S, echo: bool) {
        let text = text.as_ref();
        if echo {
            print!("{text}");
        }
        self.text.push_str(text);
    }

    pub fn get(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Return the buffered text and leave the log empty.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    /// Append the shortened output and exit code of a finished process.
    pub fn add_result(&mut self, result: &ProcessResult, max_lines: usize) {
        let shortened = shorten(result.output().trim_end(), max_lines);
        if !shortened.is_empty() {
            self.add(format!("{shortened}\n"), false);
        }
        self.add(format!("Return code: {}\n\n", result.exit_code()), true);
    }
}

/// Store the full `output` under `name` when the report only shows a shortened copy.
///
/// Returns whether an attachment was added.
pub fn attach_if_long(
    attachments: &mut Attachments,
    name: String,
    output: &str,
    max_lines: usize,
) -> bool {
    if !exceeds(output, max_lines) {
        return false;
    }
    attachments.insert(name, cap_bytes(output, MAX_ATTACHMENT_BYTES));
    true
}
