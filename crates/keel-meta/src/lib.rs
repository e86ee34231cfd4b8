pub mod etcd;
pub mod memory;
pub mod types;

pub use etcd::EtcdKvStore;
pub use memory::MemoryKvStore;
pub use types::{CasOutcome, KvEntry, KvStore, WatchEvent, WatchStream};
