//! Domain entities.
//! Framework-agnostic representation of products, purchases and payments.

pub mod money;
pub mod payment;
pub mod product;
pub mod purchase;

pub use payment::{PaymentGateway, PaymentRecord, PaymentStatus};
pub use product::Product;
pub use purchase::{PurchaseIntent, PurchaseStatus};

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
