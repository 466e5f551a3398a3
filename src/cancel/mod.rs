//! Cancellation signals for queued lock requests.
//!
//! A [`CancelToken`] is a caller-owned, cloneable signal. Lock requests that
//! cannot be granted immediately register a listener on the token; firing the
//! token withdraws every such request that is still queued. Requests that have
//! already been granted are unaffected.

pub mod token;

pub use token::{CancelToken, ListenerId};
