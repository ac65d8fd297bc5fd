pub mod location;
pub mod record;
pub mod segment;

pub use location::LocationSample;
pub use record::{RunStatus, RunningRecord};
pub use segment::RunningRecordItem;
