//! Position protection and reconciliation.
//!
//! - Stop-loss and trailing-stop maintenance with a per-venue loss limit
//! - Detection of protective orders that filled between cycles
//! - Advisory comparison of ledger exposure against venue positions

mod protection;
mod reconciliation;

pub use protection::{
    leg_exposures, stop_loss_price, trailing_activation_price, LegExposure, ProtectionVerdict,
    ProtectiveFill, ProtectiveOrderManager, ProtectiveOrderSpec,
};
pub use reconciliation::{
    expected_exposure, ReconciliationReport, Reconciler, VenueReconciliation,
};
