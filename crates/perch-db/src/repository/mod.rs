//! Repositories — SQL access, one module per aggregate.

pub mod devices;
pub mod pairing;
pub mod sessions;
pub mod users;
