//! Window-manager policy for a phone
//!
//! Decides where windows go, which way the screen faces, what hardware
//! keys do and when the lock screen shows. The window server, input
//! system and system services are reached only through the traits in
//! [`services`]; deferred work runs on a [`handler::PolicyScheduler`].

pub mod admission;
pub mod chrome;
pub mod config;
pub mod device;
pub mod display;
pub mod error;
pub mod geometry;
pub mod handler;
pub mod input;
pub mod keyguard;
pub mod layout;
pub mod policy;
pub mod replay;
pub mod rotation;
pub mod services;
pub mod settings;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{PolicyError, Result};
pub use policy::PhonePolicy;
