pub mod message;
pub mod notification;
pub mod permit;
pub mod request;
pub mod stage;

pub use message::{AdmissionMessage, QueueMessage};
pub use notification::{CompletionNotification, ReviewNotification};
pub use permit::{AcquireOutcome, PermitCounter};
pub use request::{
    FailureReason, RequestRecord, RequestStatus, ReviewOutcome, TraceEntry, TraceOutcome,
};
pub use stage::Stage;
