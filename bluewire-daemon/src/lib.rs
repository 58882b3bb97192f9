/*!
 * Bluewire Bluetooth Integration Daemon
 * Adapter and device state, pairing agents, transfer sessions and discovery
 */

pub mod actions;
pub mod adapter_settings;
pub mod agent;
pub mod bluetooth;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod ipc;
pub mod model;
pub mod projector;
pub mod protocol;
pub mod session;
pub mod state;

pub use daemon::{Daemon, DaemonHandle};
pub use error::{BluetoothError, Result};
