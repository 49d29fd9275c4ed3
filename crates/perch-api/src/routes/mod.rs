//! API route modules.

pub mod auth;
pub mod devices;
pub mod health;
pub mod pairing;
pub mod proxy;
