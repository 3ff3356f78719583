//! RESP reply-stream framing.
//!
//! The proxy forwards client request bytes verbatim, so only the upstream
//! reply stream needs structure: it must be cut into complete messages so
//! each one can be routed back to the client whose request produced it.
//! [`split`] is a pure function over a byte range; it never copies payload
//! data and never consumes a partial trailing frame.

pub mod error;
pub mod frame;

pub use error::FrameError;
pub use frame::{SplitFrames, split};
