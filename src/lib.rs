//! A PostgreSQL client built around a throughput-oriented query pipeline.
//!
//! # Features
//!
//! - **Batched execution**: [`Pipeline`] joins queued statements into one
//!   round trip and matches results back to the queries that produced them
//! - **Exact failure reporting**: a failed batch is replayed one statement at
//!   a time, so the error lands on the query that caused it
//! - **Sans-I/O state machines**: Protocol logic is separated from I/O
//!
//! # Example
//!
//! ```no_run
//! use pgpipe::sync::Conn;
//! use pgpipe::Opts;
//!
//! fn main() -> pgpipe::error::Result<()> {
//!     let opts = Opts {
//!         host: "localhost".into(),
//!         user: "postgres".into(),
//!         database: Some("mydb".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let mut conn = Conn::new(opts)?;
//!     {
//!         let mut pipeline = conn.pipeline()?;
//!         pipeline.retain(16)?;
//!
//!         let ids = (1..=3)
//!             .map(|i| pipeline.insert(&format!("SELECT {}", i)))
//!             .collect::<Result<Vec<_>, _>>()?;
//!         pipeline.complete()?;
//!
//!         for id in ids {
//!             let n: i32 = pipeline.retrieve_id(id)?.one_field()?;
//!             println!("{}: {}", id, n);
//!         }
//!     }
//!
//!     conn.close()?;
//!     Ok(())
//! }
//! ```

pub mod buffer_set;
pub mod conversion;
pub mod error;
pub mod opts;
pub mod pipeline;
pub mod protocol;
pub mod result;
pub mod state;

#[cfg(feature = "sync")]
pub mod sync;

pub use buffer_set::BufferSet;
pub use conversion::FromText;
pub use error::{Error, ErrorFields, Result};
pub use opts::Opts;
pub use pipeline::{Pipeline, PipelineConn, QueryId};
pub use protocol::types::{FormatCode, Oid, TransactionStatus};
pub use result::{Column, QueryResult, ResultStatus, Row};
