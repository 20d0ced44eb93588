//! Bounce (non-delivery report) generation: a new envelope with the
//! null sender, addressed to the original sender, carrying an RFC 3464
//! `multipart/report` body with the failing reply and the original
//! message attached.

use std::fmt::Write as _;

use chrono::Utc;
use postrider_common::{Envelope, Reply};
use tracing::{info, warn};
use uuid::Uuid;

/// Builds bounce envelopes for permanently failed deliveries.
#[derive(Debug, Clone)]
pub struct BounceGenerator {
    /// Reported as the `Reporting-MTA`.
    pub hostname: String,
}

impl BounceGenerator {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Synthesize the bounce for `envelope` failing with `reply`.
    ///
    /// Returns `None` when the original sender is empty: a failed bounce
    /// is logged and dropped, never bounced again.
    #[must_use]
    pub fn build(&self, envelope: &Envelope, reply: &Reply) -> Option<Envelope> {
        let Some(sender) = envelope.sender.as_ref() else {
            warn!(%reply, "not bouncing a null-sender envelope");
            return None;
        };
        info!(sender = %sender, %reply, "generating bounce");

        let boundary = format!("report_{}", Uuid::new_v4().simple());
        let client_name = envelope.client.host.as_deref().unwrap_or("unknown");
        let client_ip = envelope
            .client
            .ip
            .map_or_else(|| String::from("unknown"), |ip| ip.to_string());
        let protocol = envelope.client.protocol();
        let status = reply
            .enhanced_status()
            .map_or_else(|| String::from("5.0.0"), str::to_owned);

        let mut body = String::new();
        let _ = write!(
            body,
            "This is a multi-part message in MIME format.\r\n\
             \r\n\
             --{boundary}\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             Delivery failed.\r\n\
             \r\n\
             Destination host responded:\r\n\
             {reply}\r\n\
             \r\n"
        );

        let _ = write!(
            body,
            "--{boundary}\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             Reporting-MTA: dns; {hostname}\r\n\
             Remote-MTA: dns; {client_name} [{client_ip}]\r\n\
             Arrival-Date: {arrival}\r\n\
             \r\n",
            hostname = self.hostname,
            arrival = envelope
                .timestamp
                .unwrap_or_else(Utc::now)
                .to_rfc2822(),
        );
        for recipient in &envelope.recipients {
            let _ = write!(
                body,
                "Final-Recipient: rfc822; {recipient}\r\n\
                 Action: failed\r\n\
                 Status: {status}\r\n\
                 Diagnostic-Code: {protocol}; {reply}\r\n\
                 \r\n"
            );
        }

        let _ = write!(
            body,
            "--{boundary}\r\n\
             Content-Type: message/rfc822\r\n\
             \r\n"
        );
        let mut body = body.into_bytes();
        body.extend_from_slice(&envelope.flatten());
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let mut bounce = Envelope::new(None);
        bounce.recipients = vec![sender.clone()];
        bounce.receiver = Some(self.hostname.clone());
        bounce.timestamp = Some(Utc::now());
        bounce.append_header("From", "MAILER-DAEMON");
        bounce.append_header("To", sender.as_str());
        bounce.append_header("Subject", "Undelivered Mail Returned to Sender");
        bounce.append_header("Auto-Submitted", "auto-replied");
        bounce.append_header("MIME-Version", "1.0");
        bounce.append_header(
            "Content-Type",
            format!(
                "multipart/report; report-type=delivery-status; boundary=\"{boundary}\""
            ),
        );
        bounce.body = body;
        Some(bounce)
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::{Envelope, Mailbox, Reply};

    use super::BounceGenerator;

    fn failed_envelope() -> Envelope {
        let mut env = Envelope::new(Some(Mailbox::parse("sender@origin.example").unwrap()));
        env.recipients = vec![Mailbox::parse("dead@target.example").unwrap()];
        env.append_header("Subject", "original subject");
        env.body = b"original body\r\n".to_vec();
        env.client.ip = Some("192.0.2.4".parse().unwrap());
        env.client.host = Some("client.origin.example".into());
        env.client.extended = true;
        env
    }

    #[test]
    fn bounce_targets_original_sender_with_null_sender() {
        let generator = BounceGenerator::new("mx.local.example");
        let reply = Reply::new(550, "5.1.1 No such user");
        let bounce = generator.build(&failed_envelope(), &reply).unwrap();

        assert!(bounce.sender.is_none());
        assert_eq!(bounce.recipients.len(), 1);
        assert_eq!(bounce.recipients[0].as_str(), "sender@origin.example");
        assert_eq!(bounce.header("From"), Some("MAILER-DAEMON"));
    }

    #[test]
    fn bounce_body_carries_report_parts() {
        let generator = BounceGenerator::new("mx.local.example");
        let reply = Reply::new(550, "5.1.1 No such user");
        let bounce = generator.build(&failed_envelope(), &reply).unwrap();
        let body = String::from_utf8_lossy(&bounce.body);

        assert!(body.contains("Delivery failed."));
        assert!(body.contains("550 5.1.1 No such user"));
        assert!(body.contains("Reporting-MTA: dns; mx.local.example"));
        assert!(body.contains("Remote-MTA: dns; client.origin.example [192.0.2.4]"));
        assert!(body.contains("Final-Recipient: rfc822; dead@target.example"));
        assert!(body.contains("Action: failed"));
        assert!(body.contains("Status: 5.1.1"));
        assert!(body.contains("Content-Type: message/rfc822"));
        // The original message rides along, headers and all.
        assert!(body.contains("Subject: original subject"));
        assert!(body.contains("original body"));
        assert!(
            bounce
                .header("Content-Type")
                .unwrap()
                .starts_with("multipart/report; report-type=delivery-status;")
        );
    }

    #[test]
    fn null_sender_is_never_bounced() {
        let generator = BounceGenerator::new("mx.local.example");
        let mut env = failed_envelope();
        env.sender = None;
        assert!(
            generator
                .build(&env, &Reply::new(550, "5.0.0 Failed"))
                .is_none()
        );
    }
}
