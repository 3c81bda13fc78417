pub mod adjustment;
pub mod booking;
pub mod event;

pub use adjustment::{AdjustmentKind, AdjustmentStatus, CapacityAdjustment, NewAdjustment};
pub use booking::{
    Booking, BookingDetails, BookingDraft, BookingItem, BookingItemRequest, BookingReceipt,
    BookingRequest, BookingStatus, ItemLine, Payment, PaymentOutcome, PaymentStatus,
};
pub use event::{EventSnapshot, EventStatus};
