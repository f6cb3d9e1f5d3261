//! A long-running server bridging a TCP command port to a CAN bus behind a
//! USB-to-serial adapter with a line-oriented text protocol.
//!
//! Clients connect to a loopback TCP port and register named workers, each
//! bound to a CAN identifier and a behaviour (`raw`, `canopen`, `stepper`,
//! `emulation`). Worker commands become CAN frames (raw or expedited
//! CANopen SDO), and everything received from the bus is fanned back out:
//! to the worker owning the identifier, to the optional ID-0 tap, and -
//! rendered as text - to every connected client.
//!
//! ## Architecture
//!
//! Four pieces meet through process-global queues:
//!
//! * [`adapter`] owns the serial device: line reader with echo handshake,
//!   frame polling and disconnect detection;
//! * [`supervisor`] drives the adapter, drains the outbound bus and
//!   dispatches received frames through the worker [`registry`];
//! * [`registry`] spawns and addresses the per-node worker threads defined
//!   in [`roles`] and [`stepper`];
//! * [`server`] multiplexes TCP clients, routes their commands via
//!   [`proto`] and fans broadcast lines out once per poll tick.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use canbridge::{Registry, Router, Server, ServerConfig};
//! use crossbeam_channel::unbounded;
//!
//! let (broadcast_tx, broadcast_rx) = unbounded();
//! let (outbound_tx, _outbound_rx) = unbounded();
//! let (ctrl_tx, _ctrl_rx) = unbounded();
//!
//! let registry = Arc::new(Registry::new(broadcast_tx.clone(), outbound_tx));
//! let router = Router::new(Arc::clone(&registry), ctrl_tx, broadcast_tx);
//!
//! let config = ServerConfig { port: 4444, echo: false, max_clients: 16 };
//! Server::bind(&config, router, broadcast_rx)?.run()?;
//! # Ok::<(), canbridge::ServerError>(())
//! ```

pub mod adapter;
pub mod command;
pub mod config;
pub mod datafile;
pub mod dict;
pub mod discover;
pub mod frame;
pub mod parser;
pub mod pidfile;
pub mod proto;
pub mod registry;
pub mod roles;
pub mod sdo;
pub mod server;
pub mod stepper;
pub mod supervisor;
pub mod util;

pub use adapter::{Adapter, AdapterError};
pub use config::Config;
pub use discover::DeviceFilter;
pub use frame::CanFrame;
pub use parser::{parse_frame_from_line, FrameParseError};
pub use proto::Router;
pub use registry::{Registry, RegistryError, WorkerCtx};
pub use roles::Role;
pub use sdo::{abort_text, Ccs, Sdo, SdoValue};
pub use server::{Server, ServerConfig, ServerError};
pub use supervisor::{CtrlMsg, Supervisor, SupervisorError};
