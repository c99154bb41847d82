pub mod ai;
pub mod audit;
pub mod calendar;
pub mod calendar_store;
pub mod clock;
pub mod conversation;
pub mod escalation;
pub mod extraction;
pub mod scheduling;
pub mod sessions;
pub mod usage;
