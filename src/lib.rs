//! Remote-object bridge between a UI and an isolated compute worker.
//!
//! The UI side holds [`Connection`]s and typed proxies ([`bridge::Seq`],
//! [`bridge::Assembly`], ...). Every proxy method sends one request to the
//! worker and returns a future of the reply. Worker objects live until the
//! proxy is explicitly freed.
//!
//! ```no_run
//! use clonifier::bridge::{Connection, proxies};
//! use clonifier::config::BridgeConfig;
//!
//! # async fn demo() -> clonifier::error::Result<()> {
//! let conn = Connection::start(&BridgeConfig::in_process());
//! let seqs = proxies::parse_fasta(&conn, b">a\nACGT\n".to_vec()).await?;
//! for seq in seqs {
//!     println!("{:?}", seq.get_metadata().await?);
//!     seq.free();
//! }
//! conn.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod slab;
pub mod suspense;
pub mod version;
pub mod worker;

pub use bridge::{Connection, ConnectionOptions, SupervisorState};
pub use config::{BackendKind, BridgeConfig};
pub use error::{BridgeError, FatalError, Result};
pub use suspense::{CachedReply, MethodCache, Suspend};
