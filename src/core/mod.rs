//! Connection core: persistence, process supervision, output
//! classification and the lifecycle controller.

pub mod classifier;
pub mod client;
pub mod controller;
pub mod observer;
pub mod store;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;
