//! HTTP handlers for credit-service.

pub mod accounts;
pub mod coupons;
pub mod credits;
pub mod health;
pub mod instances;
pub mod metering;
