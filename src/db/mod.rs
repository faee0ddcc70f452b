pub mod remittances;

pub use remittances::{within_transaction, PgRemittanceStore};
