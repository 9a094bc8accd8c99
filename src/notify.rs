//! Notification dispatch for alarm events. One send path per channel
//! variant; retryable failures back off exponentially (with jitter) inside
//! a bounded total duration, permanent failures are logged and skipped by
//! the caller.

use std::time::{Duration, Instant};

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rand::Rng;
use thiserror::Error;

use crate::models::alarm::{Alarm, AlarmEvent, NotificationChannel, SyslogProtocol};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 587,
            user: None,
            pass: None,
            from: "logsift@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    /// Per-attempt timeout for one channel send.
    pub channel_timeout_secs: u64,
    /// Total retry budget for one dispatch.
    pub max_retry_elapsed_secs: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            channel_timeout_secs: 10,
            max_retry_elapsed_secs: 60,
        }
    }
}

fn build_smtp_transport(cfg: &SmtpConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = cfg.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(cfg.port);
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

pub struct Notifier {
    http: reqwest::Client,
    smtp: Option<AsyncSmtpTransport<Tokio1Executor>>,
    smtp_from: String,
    settings: NotifySettings,
}

impl Notifier {
    pub fn new(smtp_config: &SmtpConfig, settings: NotifySettings) -> Self {
        let smtp = build_smtp_transport(smtp_config);
        if smtp.is_some() {
            tracing::info!("notifier: SMTP configured for email channels");
        }
        Self {
            http: reqwest::Client::new(),
            smtp,
            smtp_from: smtp_config.from.clone(),
            settings,
        }
    }

    /// Send one event to one channel, retrying retryable failures with
    /// exponential backoff until the retry budget runs out.
    pub async fn dispatch(
        &self,
        channel: &NotificationChannel,
        alarm: &Alarm,
        event: &AlarmEvent,
    ) -> Result<(), NotifyError> {
        let started = Instant::now();
        let budget = Duration::from_secs(self.settings.max_retry_elapsed_secs);
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.send_once(channel, alarm, event).await {
                Ok(()) => return Ok(()),
                Err(NotifyError::Permanent(e)) => return Err(NotifyError::Permanent(e)),
                Err(NotifyError::Retryable(e)) => {
                    if started.elapsed() + backoff >= budget {
                        return Err(NotifyError::Retryable(format!("{e} (retries exhausted)")));
                    }
                    tracing::warn!("alarm '{}': dispatch failed, retrying: {e}", alarm.name);
                    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                    tokio::time::sleep(backoff + jitter).await;
                    backoff = (backoff * 2).min(Duration::from_secs(16));
                }
            }
        }
    }

    async fn send_once(
        &self,
        channel: &NotificationChannel,
        alarm: &Alarm,
        event: &AlarmEvent,
    ) -> Result<(), NotifyError> {
        let timeout = Duration::from_secs(self.settings.channel_timeout_secs);
        let send = async {
            match channel {
                NotificationChannel::Email { addr } => self.send_email(addr, alarm, event).await,
                NotificationChannel::Webhook { url, headers } => {
                    self.send_webhook(url, headers, alarm, event).await
                }
                NotificationChannel::Syslog {
                    host,
                    port,
                    protocol,
                    facility,
                } => send_syslog(host, *port, *protocol, *facility, alarm, event).await,
                NotificationChannel::Pagerduty {
                    integration_key,
                    severity,
                } => self.send_pagerduty(integration_key, severity, alarm, event).await,
            }
        };
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Retryable("channel timeout".to_string())),
        }
    }

    async fn send_email(
        &self,
        addr: &str,
        alarm: &Alarm,
        event: &AlarmEvent,
    ) -> Result<(), NotifyError> {
        let Some(transport) = &self.smtp else {
            return Err(NotifyError::Permanent(
                "email channel configured but SMTP not set up".to_string(),
            ));
        };
        let to = addr
            .parse()
            .map_err(|e| NotifyError::Permanent(format!("bad recipient '{addr}': {e}")))?;
        let from = self
            .smtp_from
            .parse()
            .map_err(|e| NotifyError::Permanent(format!("bad sender: {e}")))?;
        let subject = format!("[logsift] alarm '{}' {}", alarm.name, event.status.as_str());
        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(summary_text(alarm, event))
            .map_err(|e| NotifyError::Permanent(format!("failed to build email: {e}")))?;
        transport
            .send(email)
            .await
            .map(|_| ())
            .map_err(|e| NotifyError::Retryable(format!("smtp send failed: {e}")))
    }

    async fn send_webhook(
        &self,
        url: &str,
        headers: &std::collections::BTreeMap<String, String>,
        alarm: &Alarm,
        event: &AlarmEvent,
    ) -> Result<(), NotifyError> {
        let mut request = self.http.post(url).json(&payload(alarm, event));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Retryable(format!("webhook request failed: {e}")))?;
        classify_status(response.status())
    }

    async fn send_pagerduty(
        &self,
        integration_key: &str,
        severity: &str,
        alarm: &Alarm,
        event: &AlarmEvent,
    ) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "routing_key": integration_key,
            "event_action": "trigger",
            "dedup_key": event.id,
            "payload": {
                "summary": summary_text(alarm, event),
                "source": "logsift",
                "severity": severity,
                "custom_details": payload(alarm, event),
            },
        });
        let response = self
            .http
            .post("https://events.pagerduty.com/v2/enqueue")
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Retryable(format!("pagerduty request failed: {e}")))?;
        classify_status(response.status())
    }
}

fn classify_status(status: reqwest::StatusCode) -> Result<(), NotifyError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status.as_u16() == 429 {
        Err(NotifyError::Retryable(format!("status {status}")))
    } else {
        Err(NotifyError::Permanent(format!("status {status}")))
    }
}

/// RFC 3164 style line over UDP or TCP.
async fn send_syslog(
    host: &str,
    port: u16,
    protocol: SyslogProtocol,
    facility: u8,
    alarm: &Alarm,
    event: &AlarmEvent,
) -> Result<(), NotifyError> {
    // severity 3 (error) within the configured facility
    let priority = (facility as u16) * 8 + 3;
    let timestamp = chrono::Utc::now().format("%b %e %H:%M:%S");
    let line = format!(
        "<{priority}>{timestamp} logsift alarm[{}]: {}",
        alarm.id,
        summary_text(alarm, event)
    );
    match protocol {
        SyslogProtocol::Udp => {
            let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| NotifyError::Retryable(format!("udp bind failed: {e}")))?;
            socket
                .send_to(line.as_bytes(), (host, port))
                .await
                .map_err(|e| NotifyError::Retryable(format!("udp send failed: {e}")))?;
            Ok(())
        }
        SyslogProtocol::Tcp => {
            use tokio::io::AsyncWriteExt;
            let mut stream = tokio::net::TcpStream::connect((host, port))
                .await
                .map_err(|e| NotifyError::Retryable(format!("tcp connect failed: {e}")))?;
            stream
                .write_all(format!("{line}\n").as_bytes())
                .await
                .map_err(|e| NotifyError::Retryable(format!("tcp write failed: {e}")))?;
            Ok(())
        }
    }
}

fn summary_text(alarm: &Alarm, event: &AlarmEvent) -> String {
    format!(
        "alarm '{}' {}: {} match(es) in the last {} minute(s) ({} {})",
        alarm.name,
        event.status.as_str(),
        event.match_count,
        alarm.time_window_minutes,
        alarm.condition.as_str(),
        alarm.threshold,
    )
}

fn payload(alarm: &Alarm, event: &AlarmEvent) -> serde_json::Value {
    serde_json::json!({
        "alarm": alarm.name,
        "alarmId": alarm.id,
        "eventId": event.id,
        "status": event.status.as_str(),
        "matchCount": event.match_count,
        "threshold": alarm.threshold,
        "condition": alarm.condition.as_str(),
        "query": alarm.query,
        "triggeredAt": event.triggered_at,
        "details": event.details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::alarm::{AlarmCondition, AlarmStatus};

    fn alarm() -> Alarm {
        Alarm {
            id: "a1".into(),
            name: "errors".into(),
            query: "level=ERROR".into(),
            is_regex: false,
            condition: AlarmCondition::CountGt,
            threshold: 0,
            time_window_minutes: 5,
            enabled: true,
            notification_channels: Vec::new(),
            throttle_window_minutes: 10,
        }
    }

    fn event() -> AlarmEvent {
        AlarmEvent {
            id: "e1".into(),
            alarm_id: "a1".into(),
            alarm_name: "errors".into(),
            status: AlarmStatus::Triggered,
            triggered_at: 1000,
            ack_at: None,
            ack_by: None,
            resolved_at: None,
            match_count: 3,
            details: String::new(),
        }
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(reqwest::StatusCode::OK).is_ok());
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY),
            Err(NotifyError::Retryable(_))
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            Err(NotifyError::Retryable(_))
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::NOT_FOUND),
            Err(NotifyError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn email_without_smtp_is_permanent() {
        let notifier = Notifier::new(&SmtpConfig::default(), NotifySettings::default());
        let channel = NotificationChannel::Email {
            addr: "ops@example.com".into(),
        };
        let result = notifier.dispatch(&channel, &alarm(), &event()).await;
        assert!(matches!(result, Err(NotifyError::Permanent(_))));
    }

    #[tokio::test]
    async fn syslog_udp_delivers_line() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        send_syslog("127.0.0.1", port, SyslogProtocol::Udp, 1, &alarm(), &event())
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        assert!(line.starts_with("<11>"));
        assert!(line.contains("alarm 'errors' TRIGGERED"));
    }

    #[test]
    fn summary_mentions_window_and_condition() {
        let text = summary_text(&alarm(), &event());
        assert!(text.contains("3 match(es)"));
        assert!(text.contains("count > 0"));
    }
}
