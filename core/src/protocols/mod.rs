//! Application-layer protocol parsing.
//!
//! Every supported protocol is a variant of [ConnParser](stream::ConnParser). The set dissected at
//! runtime is fixed at startup in a [ProtocolRegistry](stream::ProtocolRegistry), ordered by
//! priority.

pub mod stream;
