pub mod circuit_breaker;
pub mod inventory;
pub mod ledger;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod orchestrator;
pub mod reconciliation;
pub mod reference;
pub mod refunds;
pub mod repository;

pub use inventory::{HttpInventoryGateway, InventoryGateway, RemoteAdjustment};
pub use ledger::{PgSeatLedger, ReleaseOutcome, ReserveOutcome, SeatLedger};
pub use orchestrator::BookingOrchestrator;
pub use reconciliation::{ReconciliationReport, ReconciliationService};
pub use reference::ReferenceGenerator;
pub use refunds::{PgRefundOutbox, RefundScheduler};
pub use repository::{BookingRepository, PgBookingRepository, StatusUpdate};
