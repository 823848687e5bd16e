// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants shared by the queue engine, the agent and `dqtool`.
//!
//! The on-disk layout values are part of the queue file format. Changing any of
//! them makes existing queue files unreadable, so they are versioned together
//! through [`QDISK_VERSION`].

use std::time::Duration;

/// Bytes reserved at the start of every queue file for the header.
///
/// Records are never written below this offset. The reported capacity of a
/// queue file is its configured size minus this reservation.
pub const QDISK_RESERVED_SPACE: u64 = 4096;

/// Magic bytes of a non-reliable queue file.
pub const QDISK_MAGIC_NON_RELIABLE: [u8; 4] = *b"SLQF";

/// Magic bytes of a reliable queue file.
pub const QDISK_MAGIC_RELIABLE: [u8; 4] = *b"SLRQ";

/// Current on-disk format version.
pub const QDISK_VERSION: u8 = 1;

/// Size of the per-record prefix: `u32` payload length followed by a `u32` CRC32.
pub const RECORD_HEADER_SIZE: u64 = 8;

/// Upper bound for a single record payload. Anything larger is treated as corruption.
pub const MAX_RECORD_SIZE: u64 = 64 * 1024 * 1024;

pub const QUEUE_FILE_PREFIX: &str = "syslog-ng-";
pub const QUEUE_FILE_EXTENSION: &str = "qf";
pub const RELIABLE_QUEUE_FILE_EXTENSION: &str = "rqf";

/// Name of the JSON state file kept next to the queue files.
pub const PERSIST_FILE_NAME: &str = "logqueue.persist";

/// Bookkeeping held in memory for every buffered message on top of its payload.
pub const MESSAGE_MEMORY_OVERHEAD: usize = 92;

/// Smallest accepted `capacity_bytes`. Lower values are raised to this.
pub const MIN_CAPACITY_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_CAPACITY_BYTES: u64 = MIN_CAPACITY_BYTES;
pub const DEFAULT_FRONT_CACHE_SIZE: usize = 1000;

pub const DEFAULT_LOG_IW_SIZE: usize = 1000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Smallest per-connection window in static mode.
pub const MIN_STATIC_WINDOW_SIZE: usize = 100;

pub const DEFAULT_DYNAMIC_WINDOW_REALLOC_TICKS: u32 = 5;

/// Interval of one dynamic window statistics tick.
pub const DYNAMIC_WINDOW_TICK: Duration = Duration::from_secs(1);

pub const DEFAULT_TIME_REOPEN: Duration = Duration::from_secs(60);

pub const DEFAULT_SOURCE_HOST: &str = "127.0.0.1";
pub const DEFAULT_SOURCE_PORT: u16 = 5514;
pub const DEFAULT_STATS_PORT: u16 = 9577;

/// Longest line accepted by the TCP source before it is split.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Value of the `Server` header returned by the HTTP surface.
pub const SERVER_HEADER: &str = "logqueue";
