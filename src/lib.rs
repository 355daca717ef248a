//! # Tessera
//!
//! **Asynchronous request/response messaging for cooperating service
//! instances.**
//!
//! Tessera connects service instances through a shared queue substrate: a
//! consumer dispatches a request onto the destination domain's pending
//! queue, a provider executes the matching handler under a deadline, and
//! the response returns to the exact instance that asked. Delivery is
//! retried, integrity is protected by a keyed hash, and every call resolves
//! exactly once.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! tessera = "0.4"
//! ```
//!
//! ## What's Included
//!
//! - **Broker client** - reconnecting connection with backoff, pub/sub and
//!   transactional batches
//! - **Message exchange** - two pipeline directions per instance with
//!   observer fan-out
//! - **Service caller** - pending-call correlation with per-call timeouts
//! - **Service executor** - versioned handler registry with access
//!   verification
//! - **Keyed hashing** - tamper detection over canonicalized envelopes
//!
//! See the [repository](https://github.com/tessera-rs/tessera) for more
//! examples.

// Re-export everything from tessera-core
pub use tessera_core::*;
