pub mod chain;
pub mod node;
pub mod range;
pub mod session;
pub mod tree;

pub use node::{Node, NodeKey, ValueRef};
pub use range::RangeIter;
pub use session::{CowSession, ReadPages, Snapshot};
