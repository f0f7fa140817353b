#![doc = include_str!("../README.md")]
#![deny(unsafe_code, missing_docs)]

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod packet;
pub mod reassembly;
pub mod router;
pub mod sack;
pub mod simulation;
pub mod stream;
pub mod transport;
pub mod uplink;
