#![forbid(unsafe_code)]
//! Server log ingestion: chat-command grammars, the UDP log receiver and
//! the per-session feedback log.

pub mod feedback;
pub mod grammar;
pub mod receiver;

pub use feedback::FeedbackLog;
pub use grammar::{ChatLine, LogMessageType, MessageKind, ParsedLogMessage, Sender, classify};
pub use receiver::{CaptureHandle, CaptureStatus, LogListener, LogReceiver, ReceiverConfig, ReceiverError};
