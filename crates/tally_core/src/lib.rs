//! Tally Core: joint evaluation of an arithmetic expression graph across
//! several parties.
//!
//! Every party builds the same graph of variables and operators, supplies
//! its own inputs, and receives everyone else's over TCP before evaluating.
//!
//! # Architecture
//!
//! - **Framing**: `(tag: u16, length: u32, payload)` messages, big-endian.
//! - **Connections**: one TCP stream per pair of parties. The lower identity
//!   dials, announcing itself with a one-byte handshake; incoming frames are
//!   buffered by sequence tag until a consumer asks for them.
//! - **Graph**: nodes are single-assignment cells allocated in creation
//!   order, so the Nth node has the same tag at every party.
//! - **Runtime**: session barrier, `feed`, evaluation and teardown.
//! - **Values**: n-dimensional `f64` arrays, CBOR on the wire.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tally_core::{Runtime, SessionConfig, Value};
//!
//! # async fn example() -> tally_core::Result<()> {
//! let rt = Runtime::new(SessionConfig::localhost(2, 0, None)?)?;
//! let x = rt.variable("x");
//! let y = rt.variable("y");
//! let sum = &x + &y;
//!
//! let result = rt
//!     .session(|rt| async move {
//!         rt.feed([(&x, Value::scalar(1.0))]).await?;
//!         rt.evaluate(&sum).await
//!     })
//!     .await?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod graph;
pub mod party;
pub mod runtime;
pub mod slot;
pub mod value;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{PartyAddress, SessionConfig};
pub use error::{ProtocolError, Result, RuntimeError};
pub use graph::{Node, Operand};
pub use runtime::{Runtime, SessionState};
pub use value::Value;
