#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod bus;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod framing;
pub mod gateway;
mod handler;
pub mod id;
pub mod pool;
pub mod registry;
pub mod sequencer;
pub mod supervisor;

pub use bus::{BusRecord, CorrelatorExtractor, ServiceBus, StatusNotifier};
pub use config::{GatewayConfig, ReplyMode, Role};
pub use gateway::{Gateway, GatewayBuilder, GatewayStats, OutboundRequest, Target};
pub use id::ConnId;
