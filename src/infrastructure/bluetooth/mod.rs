//! Bluetooth Module
//!
//! Provides BLE communication with the counter peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Session owner - commands in, AppEvents out)            │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬─────────────┐
//!         │             │             │             │
//!         ▼             ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Bonding  │  │ Protocol │
//! │           │  │            │  │          │  │          │
//! │ - first   │  │ - link     │  │ - OS     │  │ - UUIDs  │
//! │   match   │  │   states   │  │   pairing│  │ - counter│
//! └─────┬─────┘  └─────┬──────┘  └────┬─────┘  └──────────┘
//!       └──────────────┼──────────────┘
//!                      ▼
//!               ┌─────────────┐
//!               │ BleBackend  │  WinRT or simulated
//!               └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`backend`] - Platform boundary traits
//! - [`protocol`] - Counter service UUIDs and value decoding
//! - [`scanner`] - Bounded discovery of the peripheral
//! - [`connection`] - Link state tracking and connection tasks
//! - [`bonding`] - Pairing when the peripheral demands it
//! - [`session`] - Per-connection state and task ownership
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-process peripheral

pub mod backend;
pub mod bonding;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod simulated;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::BluetoothService;
