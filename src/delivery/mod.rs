//! Asynchronous forwarding of stored submissions to webhooks and email.
//!
//! Delivery is at-least-once: the HTTP call happens outside the transaction
//! that records its outcome, so a crash between the two leaves the event due
//! and it is sent again on a later tick. Receivers that need to deduplicate
//! can key on `delivery.event_id` in the webhook body.

mod config;
mod dispatcher;
mod email;
mod processor;
mod retry;
mod store;
mod webhook;

pub use config::{
    DEFAULT_MAILGUN_API_BASE, DEFAULT_SIGNATURE_HEADER, DeliveryConfig, EMAIL_TIMEOUT,
    USER_AGENT, WEBHOOK_TIMEOUT,
};
pub use dispatcher::Dispatcher;
pub use email::{EmailMessage, EmailProcessor, compose_message, render_subject, render_text};
pub use processor::{BatchReport, DeliveryError, Processor};
pub use retry::{
    DEFAULT_BACKOFF_SCHEDULE, MAX_ATTEMPTS, MAX_ERROR_LEN, RetryDecision, RetryStrategy,
    parse_backoff_schedule, truncate_error,
};
pub use store::{
    BATCH_SIZE, EmailConfig, EmailOverrides, EmailTarget, MailgunCredentials,
    SubmissionContext, WebhookConfig, WebhookTarget, fetch_due_events, finalize_failed,
    get_event, load_email_target, load_webhook_target, record_failure, record_success,
};
pub use webhook::{WebhookProcessor, build_payload, sign_payload};
