//! Logging facade used by the lock internals.
//!
//! All diagnostics go through `tracing`; modules import the macros from here so
//! the backend can be swapped in one place.

pub use tracing::{debug, debug_span, error, trace, warn};
