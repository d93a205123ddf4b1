mod cdc;
mod dlq;
mod error;
mod event;
mod session;
mod util;

pub use cdc::{CdcRecord, PayloadRef, INLINE_PAYLOAD_MAX_BYTES};
pub use dlq::{DlqRecord, Stage};
pub use error::{Error, Result};
pub use event::{EventType, FileOperation, IngressEvent, Platform, validate_payload};
pub use session::{Acceptance, SessionStatus, session_key};
pub use util::*;
