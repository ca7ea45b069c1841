//! # TCP/TLS sockets for simcomlib
//!
//! A socket is jointly owned by the application and the modem runtime. Its
//! sixteen-bit flag word records both sides' view of the lifecycle, and the
//! derived predicates below are the only way the runtime decides what to do
//! next with a socket, so their bit patterns must stay exact.
//!
//! The application keeps a [`Socket`] handle; the runtime keeps the channel
//! binding inside the module. A socket is destroyed only by the runtime's
//! sweep, once neither side holds a reference.
//!
//! Copyright (c) 42 Technology Ltd 2021
//!
//! Dual-licensed under MIT and Apache 2.0. See the [README](../README.md) for
//! more details.

//******************************************************************************
// Sub-Modules
//******************************************************************************

// None

//******************************************************************************
// Imports
//******************************************************************************

use core::cell::{Cell, RefCell};

use embassy_time::Duration;

use crate::modem::Modem;
use crate::pipe::{Pipe, PipeReader, PipeWriter};
use crate::wait::FlagCell;

//******************************************************************************
// Types
//******************************************************************************

/// Application handle to one TCP or TLS socket.
///
/// The handle stays valid until [`Socket::release`]; after that the slot
/// belongs to the runtime again and must not be touched.
pub struct Socket<'a> {
	modem: &'a Modem<'a>,
	index: usize,
}

/// Storage and state for one socket, owned by the modem.
pub(crate) struct SocketSlot {
	/// Combined App/Modem flag word, see the `flag` constants.
	pub(crate) flags: FlagCell,
	pub(crate) port: Cell<u16>,
	pub(crate) channel: Cell<u8>,
	pub(crate) host: RefCell<heapless::String<MAX_HOST>>,
	/// Bytes handed to the module by the send in flight.
	pub(crate) outgoing: Cell<usize>,
	/// Size of the most recent send attempt.
	pub(crate) last_sent: Cell<usize>,
	/// A send failed and the transmit cursor needs re-syncing.
	pub(crate) error: Cell<bool>,
	/// Data from the remote peer, read by the application.
	pub(crate) rx: Pipe<SOCKET_BUFFER>,
	/// Data from the application, drained by the modem on send.
	pub(crate) tx: Pipe<SOCKET_BUFFER>,
}

//******************************************************************************
// Constants
//******************************************************************************

/// Capacity of each per-socket data pipe.
pub(crate) const SOCKET_BUFFER: usize = 1536;

/// Longest accepted host name.
pub(crate) const MAX_HOST: usize = 64;

/// Socket flag bits. The low byte belongs to the application side, the high
/// byte to the modem side.
pub(crate) mod flag {
	/// TLS requested for the socket.
	pub const APP_SECURE: u32 = 0x0001;
	/// The application has requested the socket to be closed.
	pub const APP_CLOSE: u32 = 0x0002;
	/// The application still holds a handle.
	pub const APP_REFERENCE: u32 = 0x0004;
	/// A handler hinted data may be available; query the module.
	pub const CHECK_INCOMING: u32 = 0x0010;
	/// A module channel number has been reserved.
	pub const MODEM_ALLOCATED: u32 = 0x0100;
	/// A connect command is in flight.
	pub const MODEM_CONNECTING: u32 = 0x0200;
	/// The channel is bound inside the module.
	pub const MODEM_REFERENCE: u32 = 0x0400;
	/// The connected event has been observed (kept after disconnect).
	pub const MODEM_CONNECTED: u32 = 0x0800;
	/// A send command is in flight.
	pub const MODEM_SENDING: u32 = 0x1000;
	/// The module has announced pending inbound bytes.
	pub const MODEM_INCOMING: u32 = 0x2000;
	/// A close command is in flight.
	pub const MODEM_CLOSING: u32 = 0x4000;
	/// Terminal state, no further module activity.
	pub const MODEM_CLOSED: u32 = 0x8000;
}

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

impl<'a> Socket<'a> {
	pub(crate) fn new(modem: &'a Modem<'a>, index: usize) -> Socket<'a> {
		Socket { modem, index }
	}

	/// Wait for the socket to finish connecting.
	///
	/// Returns whether the socket is connected; a failed attempt also
	/// completes the wait, with `false`.
	pub async fn connect(&self, timeout: Duration) -> bool {
		let slot = self.slot();
		let _ = slot
			.flags
			.wait_timeout(timeout, |f| (f & flag::MODEM_CONNECTED != 0).then_some(()))
			.await;
		slot.is_connected()
	}

	/// Ask the modem to close the socket and wait for it to happen.
	///
	/// Returns whether the socket reached the closed state in time.
	pub async fn disconnect(&self, timeout: Duration) -> bool {
		let slot = self.slot();
		slot.tx.close();
		slot.flags.set(flag::APP_CLOSE);
		self.modem.request_processing();
		slot.flags
			.wait_timeout(timeout, |f| (f & flag::MODEM_CLOSED != 0).then_some(()))
			.await
			.is_some()
	}

	/// Data received from the remote peer. Reads return 0 once the socket
	/// has closed and the buffer has drained.
	pub fn input(&self) -> PipeReader<'a, SOCKET_BUFFER> {
		// tie the pipe borrow to the modem, not this handle
		self.modem.socket_slot(self.index).rx.reader()
	}

	/// Data to send to the remote peer. Writes stop short once the socket
	/// has closed.
	pub fn output(&self) -> PipeWriter<'a, SOCKET_BUFFER> {
		self.modem.socket_slot(self.index).tx.writer()
	}

	/// Whether the socket is currently connected.
	pub fn is_connected(&self) -> bool {
		self.slot().is_connected()
	}

	/// Whether TLS was requested for this socket.
	pub fn is_secure(&self) -> bool {
		self.slot().is_secure()
	}

	/// Whether the socket has reached its terminal closed state.
	pub fn is_closed(&self) -> bool {
		self.slot().is_closed()
	}

	/// Give the socket back to the runtime.
	///
	/// The handle must not be used afterwards; the runtime closes and
	/// destroys the socket once the module side lets go too.
	pub fn release(self) {
		self.modem.release_socket(self.index);
	}
}

//******************************************************************************
// Private Functions and Impl on Private Types
//******************************************************************************

impl<'a> Socket<'a> {
	fn slot(&self) -> &'a SocketSlot {
		self.modem.socket_slot(self.index)
	}
}

impl SocketSlot {
	pub(crate) const fn new() -> SocketSlot {
		SocketSlot {
			flags: FlagCell::new(0),
			port: Cell::new(0),
			channel: Cell::new(0),
			host: RefCell::new(heapless::String::new()),
			outgoing: Cell::new(0),
			last_sent: Cell::new(0),
			error: Cell::new(false),
			rx: Pipe::new(),
			tx: Pipe::new(),
		}
	}

	/// Whether the slot is unoccupied.
	pub(crate) fn is_free(&self) -> bool {
		self.flags.get() == 0
	}

	/// Return the slot to the free pool.
	pub(crate) fn recycle(&self) {
		self.rx.close();
		self.tx.close();
		self.port.set(0);
		self.channel.set(0);
		self.host.borrow_mut().clear();
		self.outgoing.set(0);
		self.last_sent.set(0);
		self.error.set(false);
		self.flags.replace(0);
	}

	pub(crate) fn is_secure(&self) -> bool {
		self.flags.any(flag::APP_SECURE)
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.flags.any(flag::MODEM_CLOSED)
	}

	/// Freshly created: an application reference and nothing else.
	pub(crate) fn is_new(&self) -> bool {
		self.flags.get() & !flag::APP_SECURE == flag::APP_REFERENCE
	}

	pub(crate) fn is_connected(&self) -> bool {
		self.flags.get() & (flag::MODEM_CONNECTED | flag::MODEM_CLOSED) == flag::MODEM_CONNECTED
	}

	/// Closure requested, channel bound, no close in flight yet.
	pub(crate) fn needs_close(&self) -> bool {
		self.flags.get() & (flag::APP_CLOSE | flag::MODEM_REFERENCE | flag::MODEM_CLOSING)
			== (flag::APP_CLOSE | flag::MODEM_REFERENCE)
	}

	/// Allocated and still wanted, with no connection activity so far.
	pub(crate) fn needs_connect(&self) -> bool {
		self.flags.get()
			& (flag::APP_CLOSE
				| flag::APP_REFERENCE
				| flag::MODEM_ALLOCATED
				| flag::MODEM_REFERENCE
				| flag::MODEM_CONNECTING
				| flag::MODEM_CLOSING
				| flag::MODEM_CLOSED)
			== (flag::MODEM_ALLOCATED | flag::APP_REFERENCE)
	}

	pub(crate) fn can_send(&self) -> bool {
		self.flags.get()
			& (flag::MODEM_CONNECTED
				| flag::MODEM_SENDING
				| flag::MODEM_CLOSING
				| flag::MODEM_CLOSED)
			== flag::MODEM_CONNECTED
	}

	pub(crate) fn is_sending(&self) -> bool {
		self.flags.any(flag::MODEM_SENDING)
	}

	pub(crate) fn can_receive(&self) -> bool {
		self.flags.get()
			& (flag::MODEM_CONNECTED
				| flag::MODEM_INCOMING
				| flag::MODEM_CLOSING
				| flag::MODEM_CLOSED)
			== (flag::MODEM_CONNECTED | flag::MODEM_INCOMING)
			&& self.rx.writer().can_allocate()
	}

	pub(crate) fn data_to_send(&self) -> bool {
		self.is_connected() && self.can_send() && self.tx.reader().available() > 0
	}

	pub(crate) fn data_to_receive(&self) -> bool {
		self.flags.any(flag::MODEM_INCOMING)
	}

	pub(crate) fn data_to_check(&self) -> bool {
		self.flags.any(flag::CHECK_INCOMING)
	}

	pub(crate) fn can_delete(&self) -> bool {
		!self.flags.any(flag::APP_REFERENCE | flag::MODEM_REFERENCE)
	}

	pub(crate) fn is_allocated(&self) -> bool {
		self.flags.any(flag::MODEM_ALLOCATED)
	}

	/// A module channel number has been reserved for the socket.
	pub(crate) fn allocate(&self) {
		debug_assert!(!self.is_allocated());
		self.flags.set(flag::MODEM_ALLOCATED);
	}

	/// The connect command went out; the channel is now bound in the module.
	pub(crate) fn bound(&self) {
		debug_assert!(self.is_allocated());
		self.flags.set(flag::MODEM_REFERENCE);
	}

	/// The connected event arrived.
	pub(crate) fn connected(&self) {
		debug_assert!(self.is_allocated());
		let flags = self.flags.get();
		self.flags
			.replace((flags & !flag::MODEM_CONNECTING) | flag::MODEM_CONNECTED);
	}

	/// The module reported buffered inbound data.
	pub(crate) fn incoming(&self) {
		debug_assert!(self.is_connected());
		self.flags.set(flag::MODEM_INCOMING);
	}

	/// A handler hinted there may be inbound data worth querying.
	pub(crate) fn maybe_incoming(&self) {
		debug_assert!(self.is_connected());
		self.flags.set(flag::CHECK_INCOMING);
	}

	/// A receive has been requested from the module; clear the hints.
	pub(crate) fn incoming_requested(&self) {
		debug_assert!(self.is_connected());
		self.flags.clear(flag::MODEM_INCOMING | flag::CHECK_INCOMING);
	}

	/// A send command is going out.
	pub(crate) fn sending(&self) {
		debug_assert!(self.is_connected() && self.can_send());
		self.flags.set(flag::MODEM_SENDING);
	}

	/// The send in flight finished, successfully or not.
	pub(crate) fn sending_finished(&self) {
		debug_assert!(self.is_sending());
		self.flags.clear(flag::MODEM_SENDING);
	}

	/// The module dropped the connection.
	pub(crate) fn disconnected(&self) {
		debug_assert!(self.is_allocated());
		self.finished();
	}

	/// Terminal transition: close both pipes and mark the socket as having
	/// been connected and now closed, releasing the module reference.
	pub(crate) fn finished(&self) {
		self.tx.close();
		self.rx.close();
		let flags = self.flags.get();
		self.flags.replace(
			(flags & !(flag::MODEM_CONNECTING | flag::MODEM_REFERENCE))
				| flag::MODEM_CONNECTED
				| flag::MODEM_CLOSED,
		);
	}
}

//******************************************************************************
// Tests
//******************************************************************************

#[cfg(test)]
mod test {
	use super::*;

	fn slot_with(flags: u32) -> SocketSlot {
		let slot = SocketSlot::new();
		slot.flags.replace(flags);
		slot
	}

	#[test]
	fn new_socket_is_new() {
		assert!(slot_with(flag::APP_REFERENCE).is_new());
		assert!(slot_with(flag::APP_REFERENCE | flag::APP_SECURE).is_new());
		assert!(!slot_with(flag::APP_REFERENCE | flag::MODEM_ALLOCATED).is_new());
		assert!(!slot_with(flag::APP_REFERENCE | flag::APP_CLOSE).is_new());
	}

	#[test]
	fn connected_excludes_closed() {
		assert!(slot_with(flag::MODEM_CONNECTED).is_connected());
		assert!(!slot_with(flag::MODEM_CONNECTED | flag::MODEM_CLOSED).is_connected());
	}

	#[test]
	fn needs_connect_requires_exact_bits() {
		assert!(slot_with(flag::APP_REFERENCE | flag::MODEM_ALLOCATED).needs_connect());
		assert!(
			slot_with(flag::APP_REFERENCE | flag::APP_SECURE | flag::MODEM_ALLOCATED)
				.needs_connect()
		);
		assert!(!slot_with(
			flag::APP_REFERENCE | flag::MODEM_ALLOCATED | flag::MODEM_CONNECTING
		)
		.needs_connect());
		assert!(
			!slot_with(flag::APP_REFERENCE | flag::APP_CLOSE | flag::MODEM_ALLOCATED)
				.needs_connect()
		);
	}

	#[test]
	fn needs_close_requires_binding() {
		assert!(slot_with(flag::APP_CLOSE | flag::MODEM_REFERENCE).needs_close());
		assert!(
			!slot_with(flag::APP_CLOSE | flag::MODEM_REFERENCE | flag::MODEM_CLOSING)
				.needs_close()
		);
		assert!(!slot_with(flag::APP_CLOSE).needs_close());
	}

	#[test]
	fn send_gates() {
		assert!(slot_with(flag::MODEM_CONNECTED).can_send());
		assert!(!slot_with(flag::MODEM_CONNECTED | flag::MODEM_SENDING).can_send());
		assert!(!slot_with(flag::MODEM_CONNECTED | flag::MODEM_CLOSING).can_send());
	}

	#[test]
	fn receive_gates() {
		let slot = slot_with(flag::MODEM_CONNECTED | flag::MODEM_INCOMING);
		assert!(slot.can_receive());
		let slot = slot_with(flag::MODEM_CONNECTED);
		assert!(!slot.can_receive());
	}

	#[test]
	fn finished_reads_as_was_connected_now_closed() {
		let slot = slot_with(
			flag::APP_REFERENCE
				| flag::MODEM_ALLOCATED
				| flag::MODEM_CONNECTING
				| flag::MODEM_REFERENCE,
		);
		slot.finished();
		assert!(!slot.is_connected());
		assert!(slot.is_closed());
		assert!(slot.flags.any(flag::MODEM_CONNECTED));
		assert!(!slot.flags.any(flag::MODEM_CONNECTING | flag::MODEM_REFERENCE));
		assert!(slot.tx.is_closed());
		assert!(slot.rx.is_closed());
		// app reference still pending, so not deletable yet
		assert!(!slot.can_delete());
		slot.flags.clear(flag::APP_REFERENCE);
		assert!(slot.can_delete());
	}
}

//******************************************************************************
// End of File
//******************************************************************************
