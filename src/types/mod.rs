//! Core types for the replay kernel.

pub mod call;
pub mod counter;
pub mod document;
pub mod message;

pub use call::{
    CallHash, ErrorKind, ErrorRecord, JobTicket, Mode, PendingRecord, ProviderSpec, Response,
    ToolCall,
};
pub use counter::{default_salt, CounterState};
pub use document::{DocHash, Document, DocumentConversionError, DocumentInput};
pub use message::{Message, MessageHash, Role};
