//! Seams to the collaborators the pipeline consumes but does not own.

pub mod clock;
pub mod sender;
pub mod user_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use sender::Sender;
pub use user_store::UserStore;
