//! Wire types shared by the commute upload client and its hosts.

pub mod domain;
pub mod error;
pub mod protocol;
