//! Media utilities for the fanout relay
//!
//! This crate knows which payload types the relay negotiates and how to
//! register them with the webrtc-rs media engine.

pub mod codec;

pub use codec::*;
