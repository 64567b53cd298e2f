//! Operational notifications for terminal runs
//!
//! Severity maps from the run status (`success` -> info,
//! `partial_success` -> warning, `failure` -> error). Each recipient whose
//! `min_severity` is at or below the run severity gets one message; the
//! artifact is attached only for successful-enough backups under the size
//! cap. Delivery failures are recorded in the run detail and never touch the
//! run status.

use std::path::Path;

use tracing::{info, warn};

use crate::models::{
    NotificationConfig, NotificationOutcome, OutcomeStatus, Run, RunStatus, Severity,
};

mod email;
mod telegram;

pub use email::EmailTransport;
pub use telegram::TelegramTransport;

/// Notification transports, built once at startup from the environment.
/// A channel without configured transport quietly drops its messages into
/// failure outcomes.
pub struct Notifier {
    telegram: Option<TelegramTransport>,
    email: Option<EmailTransport>,
}

impl Notifier {
    pub fn from_env() -> Self {
        let telegram = TelegramTransport::from_env();
        let email = EmailTransport::from_env();
        if telegram.is_none() {
            info!("Telegram notifications disabled (DBVAULT_TELEGRAM_BOT_TOKEN not set)");
        }
        if email.is_none() {
            info!("Email notifications disabled (DBVAULT_SMTP_HOST not set)");
        }
        Self { telegram, email }
    }

    pub fn new(telegram: Option<TelegramTransport>, email: Option<EmailTransport>) -> Self {
        Self { telegram, email }
    }

    /// Deliver notifications for a terminal run. `artifact` is the stored
    /// backup spool, available for attachment while it still exists.
    pub async fn notify_run(
        &self,
        run: &Run,
        config: &NotificationConfig,
        artifact: Option<&Path>,
    ) -> Vec<NotificationOutcome> {
        let severity = Severity::for_status(run.status);
        let text = render_message(run);
        let mut outcomes = Vec::new();

        if let Some(cfg) = config.telegram.as_ref().filter(|c| c.enabled) {
            let attach = attachment_for(run, artifact, cfg.attach_backup, cfg.attach_max_mb);
            for recipient in &cfg.recipients {
                if severity < recipient.min_severity {
                    continue;
                }
                let result = match &self.telegram {
                    Some(transport) => {
                        transport.send(&recipient.chat_id, &text, attach.as_deref()).await
                    }
                    None => Err(crate::error::Error::Permanent(
                        "telegram transport not configured".into(),
                    )),
                };
                outcomes.push(outcome("telegram", &recipient.chat_id, result));
            }
        }

        if let Some(cfg) = config.email.as_ref().filter(|c| c.enabled) {
            let attach = attachment_for(run, artifact, cfg.attach_backup, cfg.attach_max_mb);
            let subject = render_subject(run);
            for recipient in &cfg.recipients {
                if severity < recipient.min_severity {
                    continue;
                }
                let result = match &self.email {
                    Some(transport) => {
                        transport
                            .send(&recipient.to, &subject, &text, attach.as_deref())
                            .await
                    }
                    None => Err(crate::error::Error::Permanent(
                        "email transport not configured".into(),
                    )),
                };
                outcomes.push(outcome("email", &recipient.to, result));
            }
        }

        outcomes
    }
}

fn outcome(
    channel: &str,
    recipient: &str,
    result: crate::error::Result<()>,
) -> NotificationOutcome {
    match result {
        Ok(()) => NotificationOutcome {
            channel: channel.to_string(),
            recipient: recipient.to_string(),
            ok: true,
            error: None,
        },
        Err(e) => {
            warn!("{} notification to {} failed: {}", channel, recipient, e);
            NotificationOutcome {
                channel: channel.to_string(),
                recipient: recipient.to_string(),
                ok: false,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Attachment gate: backups only, successful-enough, within the size cap.
fn attachment_for(
    run: &Run,
    artifact: Option<&Path>,
    attach_backup: bool,
    attach_max_mb: u64,
) -> Option<std::path::PathBuf> {
    if !attach_backup
        || run.operation != crate::models::Operation::Backup
        || !matches!(run.status, RunStatus::Success | RunStatus::PartialSuccess)
    {
        return None;
    }
    let path = artifact?;
    let size = std::fs::metadata(path).ok()?.len();
    if size <= attach_max_mb.saturating_mul(1024 * 1024) {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn render_subject(run: &Run) -> String {
    format!(
        "[dbvault] {} {} for {}",
        run.operation.as_str(),
        run.status.as_str(),
        run.target_name
    )
}

/// Plain-text run summary shared by both channels.
fn render_message(run: &Run) -> String {
    let mut lines = vec![
        format!(
            "{} {}: {}",
            run.operation.as_str(),
            run.status.as_str(),
            run.target_name
        ),
        format!("run: {}", run.id),
    ];
    if let Some(schedule) = &run.schedule_name {
        lines.push(format!("schedule: {}", schedule));
    }
    lines.push(format!(
        "started: {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(finished) = run.finished_at {
        lines.push(format!(
            "finished: {}",
            finished.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    if let Some(size) = run.file_size_mb {
        lines.push(format!("size: {:.2} MB", size));
    }
    for dest in &run.detail.destinations {
        let mark = match dest.status {
            OutcomeStatus::Success => "ok",
            OutcomeStatus::Failure => "FAILED",
        };
        match &dest.error {
            Some(err) => lines.push(format!("- {}: {} ({})", dest.destination_name, mark, err)),
            None => lines.push(format!("- {}: {}", dest.destination_name, mark)),
        }
    }
    if let Some(error) = &run.error_message {
        lines.push(format!("error: {}", error));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DestinationOutcome, Operation, RunDetail, TelegramNotifyConfig, TelegramRecipient, Trigger,
    };
    use chrono::Utc;

    fn run(status: RunStatus) -> Run {
        Run {
            id: "run-1".into(),
            operation: Operation::Backup,
            trigger: Trigger::Scheduled,
            target_id: "t1".into(),
            target_name: "pg-app".into(),
            schedule_id: Some("s1".into()),
            schedule_name: Some("nightly".into()),
            destination_id: None,
            destination_name: None,
            backup_id: None,
            backup_filename: Some("backup_pg_app_20250301_033000.sql.gz".into()),
            file_size_mb: Some(1.5),
            status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            error_message: None,
            detail: RunDetail {
                destinations: vec![DestinationOutcome {
                    destination_id: "__local__".into(),
                    destination_name: "Local storage".into(),
                    status: OutcomeStatus::Success,
                    backup_id: Some("x".into()),
                    bytes: Some(1024),
                    duration_ms: 42,
                    error: None,
                }],
                ..Default::default()
            },
        }
    }

    fn telegram_config(min_severity: Severity) -> NotificationConfig {
        NotificationConfig {
            telegram: Some(TelegramNotifyConfig {
                enabled: true,
                recipients: vec![TelegramRecipient {
                    chat_id: "42".into(),
                    min_severity,
                }],
                attach_backup: false,
                attach_max_mb: 25,
            }),
            email: None,
        }
    }

    #[tokio::test]
    async fn test_severity_gating_drops_low_severity_runs() {
        let notifier = Notifier::new(None, None);

        // partial_success (warning) < error threshold: nothing attempted
        let outcomes = notifier
            .notify_run(
                &run(RunStatus::PartialSuccess),
                &telegram_config(Severity::Error),
                None,
            )
            .await;
        assert!(outcomes.is_empty());

        // failure (error) crosses the threshold; the unconfigured transport
        // records a failed delivery instead of silently vanishing
        let outcomes = notifier
            .notify_run(
                &run(RunStatus::Failure),
                &telegram_config(Severity::Error),
                None,
            )
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].ok);
    }

    #[tokio::test]
    async fn test_disabled_channel_sends_nothing() {
        let notifier = Notifier::new(None, None);
        let mut config = telegram_config(Severity::Info);
        config.telegram.as_mut().unwrap().enabled = false;

        let outcomes = notifier
            .notify_run(&run(RunStatus::Failure), &config, None)
            .await;
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_attachment_gate() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("backup.gz");
        std::fs::write(&artifact, vec![0u8; 2 * 1024 * 1024]).unwrap();

        // Under the cap
        let r = run(RunStatus::Success);
        assert!(attachment_for(&r, Some(&artifact), true, 25).is_some());
        // Over the cap
        assert!(attachment_for(&r, Some(&artifact), true, 1).is_none());
        // attach_backup off
        assert!(attachment_for(&r, Some(&artifact), false, 25).is_none());
        // Failed runs never attach
        let failed = run(RunStatus::Failure);
        assert!(attachment_for(&failed, Some(&artifact), true, 25).is_none());
        // Restores never attach
        let mut restore = run(RunStatus::Success);
        restore.operation = Operation::Restore;
        assert!(attachment_for(&restore, Some(&artifact), true, 25).is_none());
    }

    #[test]
    fn test_message_includes_destinations_and_size() {
        let text = render_message(&run(RunStatus::PartialSuccess));
        assert!(text.contains("pg-app"));
        assert!(text.contains("partial_success"));
        assert!(text.contains("Local storage: ok"));
        assert!(text.contains("1.50 MB"));
    }
}
