pub mod envelope;
pub mod notification;
pub mod progress;
pub mod quiz;
pub mod timer;

pub use envelope::Envelope;
