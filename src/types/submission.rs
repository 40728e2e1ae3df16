use serde::{Deserialize, Serialize};
use specta::Type;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct SubmitResponse {
    pub submission_id: Uuid,
    pub webhook_event_id: Option<Uuid>,
    pub email_event_id: Option<Uuid>,
}
