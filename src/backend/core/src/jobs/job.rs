//! Job definitions and the status state machine.
//!
//! A [`MailJob`] is one recipient of one [`Content`]. Its status only ever
//! moves forward:
//!
//! ```text
//! Created ──claim──▶ InFlight ──ok──▶ Sent
//!    │                   └────err──▶ Failed
//!    └──cancel──▶ Stopped
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::error::{ErrorCode, MailflowError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Database identifier of a job. Ascending ids follow creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Database identifier of a content row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(pub i64);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ContentId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job. Persisted as a SMALLINT using the discriminants below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Created = 0,
    /// Claimed by a scheduler, owned by the dispatcher
    InFlight = 1,
    /// Accepted by the delivery gateway
    Sent = 2,
    /// Gateway error, timeout, or a fault during the send
    Failed = 3,
    /// Cancelled before it was claimed
    Stopped = 4,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Created,
        Self::InFlight,
        Self::Sent,
        Self::Failed,
        Self::Stopped,
    ];

    pub const fn as_i16(self) -> i16 {
        self as i16
    }

    /// No edge leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::InFlight)
                | (Self::Created, Self::Stopped)
                | (Self::InFlight, Self::Sent)
                | (Self::InFlight, Self::Failed)
        )
    }

    /// Validate a transition for `job_id`, returning the new status.
    pub fn transition(self, job_id: JobId, next: JobStatus) -> Result<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MailflowError::invalid_transition(job_id.0, self, next))
        }
    }
}

impl TryFrom<i16> for JobStatus {
    type Error = MailflowError;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            0 => Ok(Self::Created),
            1 => Ok(Self::InFlight),
            2 => Ok(Self::Sent),
            3 => Ok(Self::Failed),
            4 => Ok(Self::Stopped),
            other => Err(MailflowError::new(
                ErrorCode::DeserializationError,
                format!("unknown job status code {}", other),
            )),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::InFlight => write!(f, "InFlight"),
            Self::Sent => write!(f, "Sent"),
            Self::Failed => write!(f, "Failed"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════════════

/// Subject and HTML body shared by one or more jobs. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub id: ContentId,
    pub subject: String,
    pub body: String,
}

/// One recipient of one content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailJob {
    pub id: JobId,
    pub topic_id: String,
    pub recipient: String,
    pub content_id: ContentId,
    /// `None` or a past instant means eligible immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub provider_message_id: Option<String>,
    pub last_error: Option<String>,
}

impl MailJob {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Created && self.scheduled_at.map_or(true, |at| at <= now)
    }
}

/// A claimed job with its content resolved, as carried by the hand-off queue.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: MailJob,
    pub content: Arc<Content>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of an appended delivery event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Sent,
    Failed,
    Open,
    /// Provider notification type, e.g. `Bounce` or `Delivery`
    Provider(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sent => "Sent",
            Self::Failed => "Failed",
            Self::Open => "Open",
            Self::Provider(kind) => kind,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "Sent" => Self::Sent,
            "Failed" => Self::Failed,
            "Open" => Self::Open,
            other => Self::Provider(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only outcome or callback record for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub job_id: JobId,
    pub kind: EventKind,
    pub raw: serde_json::Value,
}

impl DeliveryEvent {
    pub fn sent(job_id: JobId, provider_message_id: &str) -> Self {
        Self {
            job_id,
            kind: EventKind::Sent,
            raw: serde_json::json!({ "messageId": provider_message_id }),
        }
    }

    pub fn failed(job_id: JobId, error: &str) -> Self {
        Self {
            job_id,
            kind: EventKind::Failed,
            raw: serde_json::json!({ "error": error }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ingestion
// ═══════════════════════════════════════════════════════════════════════════════

/// A validated request to create one content and one job per recipient.
///
/// Validation happens here so malformed input never reaches `Created`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    subject: String,
    body: String,
    recipients: Vec<String>,
    topic_id: String,
    scheduled_at: Option<DateTime<Utc>>,
}

/// Longest subject the content table accepts.
pub const MAX_SUBJECT_CHARS: usize = 255;

/// Longest topic id the job table accepts.
pub const MAX_TOPIC_CHARS: usize = 50;

/// Longest recipient address the job table accepts.
pub const MAX_RECIPIENT_CHARS: usize = 255;

/// Recipient address: local@domain with no whitespace, brackets, or separators.
static ADDRESS_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"^[^\s@<>()\[\],;:"]+@[^\s@<>()\[\],;:"]+$"#)
        .expect("Invalid address regex")
});

impl NewMessage {
    pub fn new<I, S>(
        subject: &str,
        body: &str,
        recipients: I,
        topic_id: &str,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(MailflowError::validation("subject cannot be empty"));
        }
        if subject.chars().count() > MAX_SUBJECT_CHARS {
            return Err(MailflowError::validation(format!(
                "subject exceeds {} characters",
                MAX_SUBJECT_CHARS
            )));
        }

        let body = body.trim();
        if body.is_empty() {
            return Err(MailflowError::validation("body cannot be empty"));
        }

        let topic_id = topic_id.trim();
        if topic_id.chars().count() > MAX_TOPIC_CHARS {
            return Err(MailflowError::validation(format!(
                "topic id exceeds {} characters",
                MAX_TOPIC_CHARS
            )));
        }

        let mut addresses = Vec::new();
        for raw in recipients {
            let address = raw.as_ref().trim();
            if address.chars().count() > MAX_RECIPIENT_CHARS {
                return Err(MailflowError::new(
                    ErrorCode::InvalidRecipient,
                    format!("email address exceeds {} characters", MAX_RECIPIENT_CHARS),
                ));
            }
            if !ADDRESS_REGEX.is_match(address) {
                return Err(MailflowError::new(
                    ErrorCode::InvalidRecipient,
                    format!("invalid email address: {}", address),
                ));
            }
            addresses.push(address.to_string());
        }
        if addresses.is_empty() {
            return Err(MailflowError::validation("recipient list cannot be empty"));
        }

        if let Some(at) = scheduled_at {
            if at < now {
                return Err(MailflowError::new(
                    ErrorCode::ScheduleInPast,
                    format!("scheduled time {} is in the past", at.to_rfc3339()),
                ));
            }
        }

        Ok(Self {
            subject: subject.to_string(),
            body: body.to_string(),
            recipients: addresses,
            topic_id: topic_id.to_string(),
            scheduled_at,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }
}

/// Ids created by a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub content_id: ContentId,
    pub job_ids: Vec<JobId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reporting
// ═══════════════════════════════════════════════════════════════════════════════

/// Number of jobs per status, for one topic or all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub created: i64,
    pub in_flight: i64,
    pub sent: i64,
    pub failed: i64,
    pub stopped: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Created => self.created += count,
            JobStatus::InFlight => self.in_flight += count,
            JobStatus::Sent => self.sent += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Stopped => self.stopped += count,
        }
    }

    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Created => self.created,
            JobStatus::InFlight => self.in_flight,
            JobStatus::Sent => self.sent,
            JobStatus::Failed => self.failed,
            JobStatus::Stopped => self.stopped,
        }
    }

    pub fn total(&self) -> i64 {
        self.created + self.in_flight + self.sent + self.failed + self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_codes_are_stable() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::try_from(status.as_i16()).unwrap(), status);
        }
        assert_eq!(JobStatus::InFlight.as_i16(), 1);
        assert_eq!(JobStatus::Stopped.as_i16(), 4);
        assert!(JobStatus::try_from(9).is_err());
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        let allowed = [
            (Created, InFlight),
            (Created, Stopped),
            (InFlight, Sent),
            (InFlight, Failed),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(from.transition(JobId(1), to).is_err());
            }
        }
    }

    #[test]
    fn test_failed_never_returns_to_created() {
        let err = JobStatus::Failed
            .transition(JobId(5), JobStatus::Created)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut job = MailJob {
            id: JobId(1),
            topic_id: String::new(),
            recipient: "a@example.com".into(),
            content_id: ContentId(1),
            scheduled_at: None,
            status: JobStatus::Created,
            provider_message_id: None,
            last_error: None,
        };
        assert!(job.is_due(now));

        job.scheduled_at = Some(now - Duration::seconds(1));
        assert!(job.is_due(now));

        job.scheduled_at = Some(now + Duration::minutes(5));
        assert!(!job.is_due(now));

        job.scheduled_at = None;
        job.status = JobStatus::InFlight;
        assert!(!job.is_due(now));
    }

    #[test]
    fn test_new_message_trims_and_validates() {
        let now = Utc::now();
        let msg = NewMessage::new(
            "  Hello  ",
            " <p>hi</p> ",
            [" good@x ", "ops@example.com"],
            "launch",
            None,
            now,
        )
        .unwrap();
        assert_eq!(msg.subject(), "Hello");
        assert_eq!(msg.body(), "<p>hi</p>");
        assert_eq!(msg.recipients(), ["good@x", "ops@example.com"]);
    }

    #[test]
    fn test_new_message_rejections() {
        let now = Utc::now();
        let to = ["a@example.com"];

        let err = NewMessage::new(" ", "body", to, "", None, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = NewMessage::new("s", "\n", to, "", None, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let empty: [&str; 0] = [];
        let err = NewMessage::new("s", "b", empty, "", None, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = NewMessage::new("s", "b", ["not-an-address"], "", None, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRecipient);

        let past = Some(now - Duration::minutes(1));
        let err = NewMessage::new("s", "b", to, "", past, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ScheduleInPast);

        let long_subject = "x".repeat(MAX_SUBJECT_CHARS + 1);
        assert!(NewMessage::new(&long_subject, "b", to, "", None, now).is_err());
    }

    #[test]
    fn test_new_message_rejects_overlong_recipient() {
        let now = Utc::now();
        let long = format!("{}@example.com", "a".repeat(300));
        let err = NewMessage::new("Hi", "<p>x</p>", [long.as_str()], "", None, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRecipient);

        let fits = format!("{}@example.com", "a".repeat(MAX_RECIPIENT_CHARS - 12));
        assert_eq!(fits.chars().count(), MAX_RECIPIENT_CHARS);
        assert!(NewMessage::new("Hi", "<p>x</p>", [fits.as_str()], "", None, now).is_ok());
    }

    #[test]
    fn test_status_counts() {
        let mut counts = StatusCounts::default();
        counts.add(JobStatus::Sent, 3);
        counts.add(JobStatus::Failed, 1);
        counts.add(JobStatus::Sent, 2);
        assert_eq!(counts.get(JobStatus::Sent), 5);
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn test_event_kind_round_trip_of_provider_types() {
        assert_eq!(EventKind::parse("Open"), EventKind::Open);
        assert_eq!(EventKind::parse("Bounce"), EventKind::Provider("Bounce".into()));
        assert_eq!(DeliveryEvent::sent(JobId(3), "m-1").kind.as_str(), "Sent");
    }
}
