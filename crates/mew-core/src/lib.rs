//! Core types for the MEW gateway
//!
//! This crate provides the protocol-level building blocks shared by the
//! gateway daemon and its tests: the envelope model, capability patterns
//! and the matcher that authorizes emission, wire framing for both
//! transports, the YAML space descriptor, and participant token
//! resolution.
//!
//! Everything here is pure or filesystem-local; connection state and
//! routing live in the `mew-gateway` crate.

pub mod capability;
pub mod config;
pub mod envelope;
pub mod framing;
pub mod logging;
pub mod tokens;

pub use capability::{CapabilityPattern, authorizes, baseline_patterns, canonical_json, dedup_patterns};
pub use envelope::{Envelope, GATEWAY_ID, PROTOCOL_VERSION, error_codes, kinds};
pub use framing::{FramingError, LspFrameCodec, StreamFrame, encode_stream_frame, parse_stream_frame};
