//! MySQL/MariaDB binlog replication
//!
//! Supports:
//! - MySQL 5.6+, 8.0+ and MariaDB 10.x
//! - Row-based replication (binlog_format=ROW), v1 and v2 row events
//! - CRC32 event checksums (stripped)
//! - `mysql_native_password` and `caching_sha2_password` (fast path)
//!
//! # Architecture
//!
//! ```text
//! MySQL Binlog → MySqlBinlogClient → BinlogStreamClient → BinlogDecoder → listener
//! ```
//!
//! # Example
//!
//! ```rust
//! use ripple_cdc::mysql::{BinlogDecoder, BinlogEvent, ColumnDef, ColumnType, EventBuilder};
//!
//! let columns = [ColumnDef::new(ColumnType::Long, 0)];
//! let builder = EventBuilder::new();
//! let mut decoder = BinlogDecoder::new();
//!
//! decoder.decode(&builder.table_map(5, "shop", "orders", &columns)).unwrap();
//! let decoded = decoder
//!     .decode(&builder.write_rows(5, &columns, &[vec![1i64.into()]]))
//!     .unwrap()
//!     .unwrap();
//!
//! match decoded.event {
//!     BinlogEvent::Rows(rows) => assert_eq!(rows.rows[0].table, "orders"),
//!     other => panic!("unexpected event {:?}", other),
//! }
//! ```

pub mod builder;
pub mod client;
pub mod decoder;
pub mod json;
pub mod protocol;
pub mod reader;

pub use builder::*;
pub use client::*;
pub use decoder::*;
pub use protocol::*;
pub use reader::ByteReader;
