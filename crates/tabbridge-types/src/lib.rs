//! Core types and traits for TabBridge.
//!
//! This crate is pure data: nothing here performs I/O. It provides
//!
//! - **Target**: addresses a broker-side recipient for routing
//! - **LiveValue**: an in-process API surface (data, callables, host objects)
//! - **Shape**: the wire-safe description of a live value, plus the
//!   introspector that produces it and the materializer that inverts it
//! - **RequestContent**: the application-layer payload of a `request` frame
//! - **BridgeError**: the error taxonomy shared by broker, client and agent
//! - **config**: serde-backed configuration for every component

pub mod config;
pub mod error;
pub mod request;
pub mod shape;
pub mod target;
pub mod value;

pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use request::{PathSegment, RequestContent};
pub use shape::{Introspector, Shape};
pub use target::{AgentKind, Target, TargetType};
pub use value::LiveValue;
