pub mod cmi;
pub mod ids;
pub mod interaction;
pub mod lifecycle;
pub mod summary;
pub mod sync;

pub use cmi::{CmiError, CmiNode};
pub use lifecycle::{LifecycleEvent, SessionState};
