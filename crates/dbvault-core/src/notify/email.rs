//! Email transport (SMTP via lettre)
//!
//! The SMTP client is blocking, so sends run on the blocking pool. The
//! attachment is read into memory; the notifier only hands over artifacts
//! already under the configured size cap.

use std::path::Path;

use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::error::{Error, Result};

pub const SMTP_HOST_ENV: &str = "DBVAULT_SMTP_HOST";
pub const SMTP_PORT_ENV: &str = "DBVAULT_SMTP_PORT";
pub const SMTP_USERNAME_ENV: &str = "DBVAULT_SMTP_USERNAME";
pub const SMTP_PASSWORD_ENV: &str = "DBVAULT_SMTP_PASSWORD";
pub const SMTP_FROM_ENV: &str = "DBVAULT_SMTP_FROM";

#[derive(Clone)]
pub struct EmailTransport {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    from: String,
}

impl EmailTransport {
    pub fn from_env() -> Option<Self> {
        let host = std::env::var(SMTP_HOST_ENV).ok().filter(|h| !h.is_empty())?;
        let from = std::env::var(SMTP_FROM_ENV)
            .ok()
            .unwrap_or_else(|| "dbvault@localhost".to_string());
        let port = std::env::var(SMTP_PORT_ENV)
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(587);
        let credentials = match (
            std::env::var(SMTP_USERNAME_ENV).ok(),
            std::env::var(SMTP_PASSWORD_ENV).ok(),
        ) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };
        Some(Self {
            host,
            port,
            credentials,
            from,
        })
    }

    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        attachment: Option<&Path>,
    ) -> Result<()> {
        let transport = self.clone();
        let to = to.to_string();
        let subject = subject.to_string();
        let body = body.to_string();
        let attachment = attachment.map(Path::to_path_buf);

        tokio::task::spawn_blocking(move || transport.send_blocking(&to, &subject, &body, attachment))
            .await
            .map_err(|e| Error::Internal(format!("smtp task panicked: {}", e)))?
    }

    fn send_blocking(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        attachment: Option<std::path::PathBuf>,
    ) -> Result<()> {
        let builder = Message::builder()
            .from(
                self.from
                    .parse()
                    .map_err(|e| Error::Permanent(format!("invalid from address: {}", e)))?,
            )
            .to(to
                .parse()
                .map_err(|e| Error::Permanent(format!("invalid recipient {}: {}", to, e)))?)
            .subject(subject);

        let message = match attachment {
            None => builder
                .body(body.to_string())
                .map_err(|e| Error::Internal(format!("message build: {}", e)))?,
            Some(path) => {
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("backup.bin")
                    .to_string();
                let bytes = std::fs::read(&path)?;
                let part = Attachment::new(file_name).body(
                    bytes,
                    ContentType::parse("application/octet-stream")
                        .map_err(|e| Error::Internal(format!("content type: {}", e)))?,
                );
                builder
                    .multipart(
                        MultiPart::mixed()
                            .singlepart(SinglePart::plain(body.to_string()))
                            .singlepart(part),
                    )
                    .map_err(|e| Error::Internal(format!("message build: {}", e)))?
            }
        };

        let mut smtp = SmtpTransport::starttls_relay(&self.host)
            .map_err(|e| Error::Transient(format!("smtp relay {}: {}", self.host, e)))?
            .port(self.port);
        if let Some((user, password)) = &self.credentials {
            smtp = smtp.credentials(Credentials::new(user.clone(), password.clone()));
        }

        smtp.build()
            .send(&message)
            .map_err(|e| Error::Transient(format!("smtp send: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_recipient_is_permanent() {
        let transport = EmailTransport {
            host: "mail.internal".into(),
            port: 587,
            credentials: None,
            from: "dbvault@example.org".into(),
        };
        let err = transport
            .send_blocking("not an address", "s", "b", None)
            .unwrap_err();
        assert_eq!(err.kind().code(), "PERMANENT");
    }
}
