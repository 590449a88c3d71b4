//! Test utilities for the GVSP receiver
//!
//! Provides synthetic datagram generation and test helpers for validating
//! the frame assembly pipeline without a camera on the network.

pub mod mock_io;
pub mod packet_generator;

pub use mock_io::*;
pub use packet_generator::*;
