use crate::backup::function_path;
use crate::backup::notifications::Notification;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use crate::backup::run_log::Attachments;
use crate::backup::validate::validate_not_blank;
use bon::Builder;
use function_name::named;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use sanitize_filename::sanitize;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::fmt::Display;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

/// SMTP server settings, read from a YAML or JSON file.
///
/// Only `server`, `port`, `sender_addr`, `username` and `password` are accepted.
/// Credentials are stored using `RedactedString` to prevent exposure in logs.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    #[validate(custom(function = validate_not_blank))]
    #[getset(get = "pub")]
    server: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[getset(get_copy = "pub")]
    port: u16,
    #[getset(get = "pub")]
    sender_addr: Address,
    #[getset(get = "pub")]
    username: String,
    #[validate(nested)]
    #[getset(get = "pub")]
    password: RedactedString,
}

/// Connection security towards the SMTP server.
///
/// - `Ssl`: TLS from the first byte (SMTPS)
/// - `Unsecured`: Plain text, only meant for local test servers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SmtpMode {
    #[default]
    Ssl,
    Unsecured,
}

impl SmtpConfig {
    /// Typed, validated settings from a parsed YAML or JSON document.
    pub fn from_document(document: serde_json::Value) -> Result<Self> {
        let config = serde_json::from_value::<SmtpConfig>(document).map_err(Error::from)?;
        config.validate().map_err(Error::from)?;
        Ok(config)
    }

    pub fn notifier<S: Into<String>>(self, sender_name: S) -> SmtpNotifier {
        SmtpNotifier::builder()
            .sender(Mailbox::new(Some(sender_name.into()), self.sender_addr.clone()))
            .config(self)
            .build()
    }
}

/// Smtp settings as read from disk.
///
/// A file that parses but does not hold usable settings, for example one with
/// an unknown key, does not stop any backup. Every `send` fails with the
/// problem instead.
#[derive(Clone, Debug)]
pub enum SmtpSettings {
    Ready(SmtpNotifier),
    Invalid { path: PathBuf, reason: String },
}

impl SmtpSettings {
    /// `.json` files are read as JSON, anything else as YAML.
    pub fn load<P: AsRef<Path>, S: Into<String>>(path: P, sender_name: S) -> Result<Self> {
        let path = path.as_ref();
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let document = File::open(path)
            .map_err(Error::from)
            .and_then(|f| {
                if is_json {
                    serde_json::from_reader::<_, serde_json::Value>(f).map_err(Error::from)
                } else {
                    serde_yml::from_reader::<_, serde_json::Value>(f).map_err(Error::from)
                }
            })
            .with_msg(format!("Parse smtp config failed: {:?}", path))?;

        Ok(match SmtpConfig::from_document(document) {
            Ok(config) => SmtpSettings::Ready(config.notifier(sender_name)),
            Err(e) => {
                tracing::warn!("Smtp config {:?} is unusable, reports will not be sent: {e}", path);
                SmtpSettings::Invalid {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        })
    }

    /// The configuration problem every `send` would report.
    pub fn error(&self) -> Option<Error> {
        match self {
            SmtpSettings::Ready(_) => None,
            SmtpSettings::Invalid { path, reason } => Some(Error::InvalidSmtpConfig {
                path: path.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

impl Notification for SmtpSettings {
    fn send<D1: Display, D2: Display>(
        &self,
        to: &Mailbox,
        topic: D1,
        msg: D2,
        attachments: &Attachments,
    ) -> Result<()> {
        match self {
            SmtpSettings::Ready(notifier) => notifier.send(to, topic, msg, attachments),
            SmtpSettings::Invalid { path, reason } => Err(Error::InvalidSmtpConfig {
                path: path.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Sends job reports through [`SmtpConfig`] with `sender` in the From header.
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct SmtpNotifier {
    config: SmtpConfig,
    sender: Mailbox,
    #[builder(default)]
    smtp_mode: SmtpMode,
}

impl SmtpNotifier {
    fn build_message<D1: Display, D2: Display>(
        &self,
        to: &Mailbox,
        topic: D1,
        msg: D2,
        attachments: &Attachments,
    ) -> Result<Message> {
        let body = attachments.iter().fold(
            MultiPart::mixed().singlepart(SinglePart::plain(msg.to_string())),
            |body, (name, content)| {
                body.singlepart(
                    Attachment::new(sanitize(name)).body(content.clone(), ContentType::TEXT_PLAIN),
                )
            },
        );
        Message::builder()
            .from(self.sender.clone())
            .to(to.clone())
            .subject(topic.to_string())
            .multipart(body)
            .map_err(Error::from)
    }
}

impl Notification for SmtpNotifier {
    #[named]
    fn send<D1: Display, D2: Display>(
        &self,
        to: &Mailbox,
        topic: D1,
        msg: D2,
        attachments: &Attachments,
    ) -> Result<()> {
        tracing::info!(
            "Sending email from {} to {} with {} attachment(s)",
            self.sender,
            to,
            attachments.len()
        );
        let email = self
            .build_message(to, topic, msg, attachments)
            .with_msg(format!("Fail to build email from {} to {}", self.sender, to))
            .with_debug_object_and_fn_name(self.config.server.clone(), function_path!())?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.inner().to_string(),
        );
        let server = self.config.server.as_str();
        let mailer = match self.smtp_mode {
            SmtpMode::Ssl => SmtpTransport::relay(server),
            SmtpMode::Unsecured => Ok(SmtpTransport::builder_dangerous(server)),
        }
        .map_err(Error::from)
        .with_msg(format!(
            "Failed to build smtp client for {}:{} with mode {:?}",
            server, self.config.port, self.smtp_mode
        ))?
        .port(self.config.port)
        .timeout(Some(SMTP_TIMEOUT))
        .credentials(creds)
        .build();

        let response = mailer
            .send(&email)
            .map_err(Error::from)
            .with_debug_object_and_fn_name(self.config.server.clone(), function_path!())?;
        if response.is_positive() {
            Ok(())
        } else {
            Err(Error::lots_of_error(
                response
                    .message()
                    .map(|m| Error::smtp_send_error(m.to_owned()))
                    .collect_vec(),
            ))
        }
    }
}
