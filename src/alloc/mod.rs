pub mod guard;
pub mod listener;
pub mod lock;
pub mod path;
pub mod raw;
pub mod registry;
pub mod thread_aware;
