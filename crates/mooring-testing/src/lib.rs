//! Testing utilities for Mooring
//!
//! This crate provides testing tools including:
//! - An in-memory document with selector queries and subtree observers
//! - A scriptable remote loader that records every call
//! - Components with scripted render behavior
//! - Descriptor builders and generators

pub mod components;
pub mod document;
pub mod loader;
pub mod scenarios;

pub use components::{FlakyComponent, RenderBehavior, ScriptedComponent};
pub use document::MemoryDocument;
pub use loader::{FakeRemoteLoader, LoadBehavior};
pub use scenarios::{descriptors_from_json, DescriptorBuilder, DescriptorGenerator};
