//! Thin client for verifying PISA appointment receipts off the critical path
//! of the tower itself: a customer (or an auditor) holds a signed receipt and
//! wants to check, independently, that the signature really does bind the
//! tower to the exact appointment it claims to cover.

pub mod receipt;

pub use receipt::{Appointment, ClientError, Receipt};
