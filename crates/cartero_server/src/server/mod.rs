#![forbid(unsafe_code)]

pub mod connection;
pub mod conversations;
pub(crate) mod db;
pub mod gateway;
pub mod health;
pub mod identity;
pub mod messages;
pub mod registry;
pub mod session;


#[cfg(test)]
mod gateway_tests;

#[cfg(test)]
mod quic_smoke_tests;
