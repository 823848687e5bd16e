// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed output queue with flow control.
//!
//! Messages admitted by a source connection go through a front cache, a
//! spillover queue file (QDISK) and, when flow control is enabled, a
//! flow-control window, before a coordinator delivers them to the destination
//! oldest-first.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod coordinator;
pub mod destination;
pub mod disk_queue;
pub mod engine;
pub mod errors;
pub mod flow_window;
pub mod front_cache;
pub mod http;
pub mod message;
pub mod persist;
pub mod qdisk;
pub mod queue_service;
pub mod source;
pub mod stats;
pub mod window;

pub use config::Config;
pub use engine::Engine;
pub use errors::{ConfigError, EngineError, QueueFileError};
pub use message::LogMessage;
