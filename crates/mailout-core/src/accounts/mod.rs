//! Sending accounts - Round-robin rotation and sticky recipient assignment

mod assignment;
mod rotation;

pub use assignment::{PendingPartition, PendingRecipient, RecipientAssignmentStore};
pub use rotation::AccountRotationQueue;
