//! Protocol implementations.
//!
//! Each protocol has a parser module for decoding requests, a response
//! module for encoding replies, and a handler driving one connection.
//!
//! ## Protocols
//! - `backup`: fixed-layout binary protocol for per-user file backup

pub mod backup;
