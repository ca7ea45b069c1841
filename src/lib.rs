//! # simcomlib - a Rust driver for SimCom cellular modems
//!
//! This crate drives the SimCom SIM800 (2G) and SIM7600 (4G) modules over
//! their serial AT interface, exposing TCP and TLS sockets, SMS submission,
//! network status and coarse cell-based location to `no_std` firmware.
//!
//! The driver owns no hardware. It talks through a pair of byte pipes (wire
//! them to your UART with [`Modem::link_input`] and [`Modem::link_output`])
//! and drives power and line configuration through the [`ModemHardware`]
//! trait; configuration comes from [`ModemOptions`]. Spawn [`Modem::run`]
//! on a single-threaded async executor, then create sockets and messages
//! from any other task on the same executor. The modem is powered on when
//! work appears and powered back off after the configured idle period.
//!
//! To open a connection, call `Modem::create_socket` and wait on
//! `Socket::connect`; the socket's input and output are byte pipes with
//! cooperative back-pressure. SMS submission works the same way through
//! `Modem::send_message`.
//!
//! Copyright (c) 42 Technology Ltd 2021
//!
//! Dual-licensed under MIT and Apache 2.0. See the [README](../README.md) for
//! more details.

#![no_std]
#![deny(missing_docs)]

//******************************************************************************
// Sub-Modules
//******************************************************************************

mod fnv;
mod message;
mod modem;
mod options;
mod pipe;
mod simcom;
mod socket;
mod wait;

#[cfg(test)]
mod test_util;

//******************************************************************************
// Imports
//******************************************************************************

#[cfg(test)]
extern crate std;

pub use fnv::{fnv1a, Fnv1a};
pub use message::Message;
pub use modem::{GsmStatus, Location, Modem, ModemStatus, NetworkInfo, SimStatus, TcpStatus};
pub use options::{CallbackType, ModemHardware, ModemOptions, Parity};
pub use pipe::{Pipe, PipePosition, PipeReader, PipeWriter};
pub use simcom::Model;
pub use socket::Socket;

//******************************************************************************
// Types
//******************************************************************************

/// The set of error codes this API can return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// All socket slots are in use.
	TooManySockets,
	/// All message slots are in use.
	TooManyMessages,
	/// Given hostname was too long for internal buffers to hold.
	HostnameTooLong,
	/// Given recipient or text was too long for an SMS.
	MessageTooLong,
}

//******************************************************************************
// Constants
//******************************************************************************

// None

//******************************************************************************
// Global Variables
//******************************************************************************

// None

//******************************************************************************
// Macros
//******************************************************************************

// None

//******************************************************************************
// Public Functions and Impl on Public Types
//******************************************************************************

// None

//******************************************************************************
// Private Functions and Impl on Private Types
//******************************************************************************

// None

//******************************************************************************
// End of File
//******************************************************************************
