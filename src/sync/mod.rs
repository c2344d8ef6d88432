//! Thread coordination primitives.
//!
//! - [`SyncQueue`]: double-ended blocking queue, the foundation primitive
//! - [`Flag`]: waitable boolean condition for cross-thread signaling
//! - [`Worklist`]: named FIFO hand-off queue built on [`SyncQueue`]

pub mod flag;
pub mod queue;
pub mod worklist;

pub use flag::Flag;
pub use queue::SyncQueue;
pub use worklist::Worklist;
