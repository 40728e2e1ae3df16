pub mod api_error;
pub mod delivery_event;
pub mod submission;

#[allow(unused_imports)]
pub use api_error::{ApiErrorCode, ApiErrorResponse};
#[allow(unused_imports)]
pub use delivery_event::{DeliveryEvent, DeliveryKind, DeliveryStatus};
#[allow(unused_imports)]
pub use submission::SubmitResponse;
