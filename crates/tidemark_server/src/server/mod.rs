#![forbid(unsafe_code)]

pub mod auth;
pub mod directory;
pub mod health;
pub mod hub;
pub mod query;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod session;
pub mod store;
pub mod typing;
pub mod unread;

#[cfg(test)]
mod hub_tests;





#[cfg(test)]
mod store_tests;

#[cfg(test)]
mod typing_tests;
