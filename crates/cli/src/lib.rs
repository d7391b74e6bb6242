//! DeviceFarm CLI
//!
//! Client library and command line for the DeviceFarm daemon. Test
//! harnesses use [`client::FarmClient::with_device`] to hold a device for
//! the length of a test.

pub mod client;
pub mod commands;
pub mod output;

mod generated {
    #![allow(clippy::all)]
    include!("generated/devicefarm.v1.rs");
}

pub use generated::*;
