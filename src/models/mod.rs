pub mod appointment;
pub mod booking;
pub mod business;
pub mod session;

pub use appointment::{AlternativeSlot, Appointment};
pub use booking::{BookingRequest, Slot, SlotName, SlotState};
pub use business::{BusinessHours, BusinessProfile, ProfileError, SearchSettings, ServiceDef, SessionPolicy};
pub use session::{
    EscalationReason, Phase, ResponseKind, SessionSnapshot, SystemResponse, TransitionEvent, Turn,
};
