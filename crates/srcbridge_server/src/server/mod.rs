#![forbid(unsafe_code)]

pub mod access;
pub mod health;
pub mod playtest;
pub mod queue;
pub mod router;

#[cfg(test)]
mod router_tests;
