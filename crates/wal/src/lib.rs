pub mod record;
pub mod replay;
pub mod wal;

pub use record::{ReadOutcome, WalRecord};
pub use replay::replay;
pub use wal::Wal;
