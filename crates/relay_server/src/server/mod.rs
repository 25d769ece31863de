#![forbid(unsafe_code)]

pub mod client;
pub mod health;
pub mod hub;
pub mod router;

#[cfg(test)]
mod client_tests;

#[cfg(test)]
mod hub_tests;
