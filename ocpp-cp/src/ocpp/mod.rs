//! OCPP 1.6J protocol implementation
//!
//! - `types`: OCPP payload types
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `correlator`: request/response correlation and outbound link

pub mod types;
pub mod messages;
pub mod correlator;

pub use types::*;
pub use messages::*;
pub use correlator::{Correlator, FrameSink, PendingResponse};
