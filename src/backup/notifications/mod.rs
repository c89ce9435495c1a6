use crate::backup::result_error::result::Result;
use crate::backup::run_log::Attachments;
use lettre::message::Mailbox;
use std::fmt::Display;

pub mod smtp;

/// Delivers a job report to an operator.
pub trait Notification {
    fn send<D1: Display, D2: Display>(
        &self,
        to: &Mailbox,
        topic: D1,
        msg: D2,
        attachments: &Attachments,
    ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::backup::result_error::error::Error;
    use std::cell::RefCell;

    #[derive(Clone, Debug)]
    pub struct Sent {
        pub to: String,
        pub subject: String,
        pub body: String,
        pub attachments: Attachments,
    }

    /// Records every message; optionally fails every send.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub fail: bool,
        sent: RefCell<Vec<Sent>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.sent.borrow().clone()
        }

        pub fn subjects(&self) -> Vec<String> {
            self.sent.borrow().iter().map(|s| s.subject.clone()).collect()
        }
    }

    impl Notification for RecordingNotifier {
        fn send<D1: Display, D2: Display>(
            &self,
            to: &Mailbox,
            topic: D1,
            msg: D2,
            attachments: &Attachments,
        ) -> Result<()> {
            self.sent.borrow_mut().push(Sent {
                to: to.to_string(),
                subject: topic.to_string(),
                body: msg.to_string(),
                attachments: attachments.clone(),
            });
            if self.fail {
                return Err(Error::smtp_send_error("mail server unreachable"));
            }
            Ok(())
        }
    }
}
