//! # Modem runtime for simcomlib
//!
//! The heart of the driver: one long-lived [`Modem`] object multiplexing a
//! strict request/response AT channel with the module's unsolicited events,
//! scheduling per-socket work, and walking the module through its power /
//! SIM / network lifecycle.
//!
//! Two fibers live here. The lifecycle task owns the AT channel and runs
//! the per-iteration scheduling loop; the RX task consumes the serial
//! stream, completes commands, dispatches events and streams binary
//! payloads into sockets. Application fibers only touch the narrow public
//! API. There is no preemption: anything another fiber may mutate is
//! re-checked after every suspension point.
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

use core::cell::RefCell;
use core::fmt::Write as _;

use embassy_futures::join::join;
use embassy_futures::yield_now;
use embassy_time::{Duration, Timer};
use log::{debug, trace, warn};

use crate::fnv::{fnv1a, scan_event, Fnv1a};
use crate::message::{self, Message, MessageSlot};
use crate::options::{CallbackType, ModemHardware, ModemOptions};
use crate::pipe::{Pipe, PipeReader, PipeWriter};
use crate::simcom::SimComState;
use crate::socket::{self, Socket, SocketSlot};
use crate::wait::{self, FlagCell, Notify, FOREVER};
use crate::Error;

//******************************************************************************
// Types
//******************************************************************************

/// Health of the module and its command channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModemStatus {
	/// Everything fine so far.
	Ok,
	/// The module did not power up after two attempts.
	PowerOnFailure,
	/// The module never answered during baud rate negotiation.
	AutoBaudFailure,
	/// An AT command failed or timed out; the channel ordering can no
	/// longer be trusted until the next lifecycle restart.
	CommandError,
}

/// State of the network registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GsmStatus {
	/// Registered on the home network.
	Ok,
	/// Registration failed.
	NoNetwork,
	/// Registered on a roaming network.
	Roaming,
	/// Still looking for a network.
	Searching,
}

/// State of the SIM card.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimStatus {
	/// SIM ready.
	Ok,
	/// No card detected.
	NotInserted,
	/// A PIN is required and none is configured.
	Locked,
	/// The configured PIN was rejected.
	BadPin,
}

/// State of the packet-data service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TcpStatus {
	/// Everything fine so far.
	Ok,
	/// GPRS attach or PDP context activation failed.
	GprsError,
	/// TLS setup was rejected.
	TlsError,
	/// A connection attempt failed.
	ConnectionError,
}

/// Coarse cell-based position, decimal degrees with the dot dropped.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Location {
	/// Longitude.
	pub lon: i32,
	/// Latitude.
	pub lat: i32,
}

/// Mobile network identity as reported by the module.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
	mcc: u16,
	mnc: u16,
	mnc_digits: u8,
}

/// The modem driver.
///
/// Create one per physical module, spawn [`Modem::run`] on the executor,
/// and wire [`Modem::link_input`] / [`Modem::link_output`] to the UART.
/// Everything else happens through sockets, messages and the status
/// accessors.
pub struct Modem<'a> {
	pub(crate) options: &'a dyn ModemOptions,
	pub(crate) st: RefCell<Inner>,
	/// Runtime signal bits, see [`signal`].
	pub(crate) signals: FlagCell,
	/// Woken when the AT result changes.
	pub(crate) at_notify: Notify,
	/// Woken after every processed line, for fibers watching module state.
	pub(crate) state_notify: Notify,
	pub(crate) sockets: [SocketSlot; MAX_SOCKETS],
	pub(crate) messages: [MessageSlot; MAX_MESSAGES],
	/// Bytes from the module.
	pub(crate) serial_rx: Pipe<SERIAL_BUFFER>,
	/// Bytes to the module.
	pub(crate) serial_tx: Pipe<SERIAL_BUFFER>,
}

/// Result of one AT command exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AtResult {
	/// Terminal OK received (and the full require mask satisfied).
	Ok,
	/// The module answered ERROR (or +CME/+CMS ERROR).
	Error,
	/// No terminal arrived within the deadline.
	Timeout,
	/// The command could not be issued at all.
	Failure,
	/// Command in flight.
	Pending,
}

/// One-shot response delegate armed between lock and command.
///
/// Handlers are a closed set, so they are dispatched by tag instead of
/// stored as callables; the payload carries what each one needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ResponseHandler {
	/// Model detection lines from `ATI` / `AT+GSV`.
	Identification,
	/// A bare IP address line (SIM800 `+CIFSR`).
	PlainIp,
	/// `+NETOPEN:`-family completion events with an error code.
	NetCch,
	/// `SHUT OK` after `+CIPSHUT`.
	ShutOk,
	/// `NORMAL POWER DOWN` after `+CPOWD`.
	PowerDown,
	/// SIM800 send completion (`DATA ACCEPT` / `SEND FAIL`).
	Send800,
	/// SIM7600 send completion (`+CCHSEND:`).
	Send7600,
	/// SIM800 `+CIPACK:` transmit-cursor recovery for one socket.
	SendAck {
		/// Index of the socket being re-synced.
		socket: usize,
	},
	/// `+CMGS:` message reference for one message.
	MessageRef {
		/// Index of the message being sent.
		message: usize,
	},
	/// `+CLBS:` location fields.
	Location,
}

/// What to feed the module when it raises the `>` transmit prompt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Transmit {
	/// No binding; a prompt now is unexpected.
	None,
	/// Copy exactly `len` bytes from the socket's output, not consuming
	/// them (the module's acknowledgement does that).
	Socket {
		/// Socket index.
		index: usize,
		/// Number of bytes the command announced.
		len: usize,
	},
	/// Write the message text followed by CTRL+Z.
	Message {
		/// Message index.
		index: usize,
	},
}

/// AT channel state, valid between lock acquisition and release.
pub(crate) struct AtState {
	pub(crate) result: AtResult,
	/// Bits that must all be completed before the command counts as done.
	pub(crate) require: u8,
	pub(crate) complete: u8,
	/// One-shot timeout override for the next command.
	pub(crate) next_timeout: Option<Duration>,
	/// One-shot response delegate for the next command.
	pub(crate) response: Option<ResponseHandler>,
	pub(crate) transmit: Transmit,
}

/// Most recently received line and the cursor over its field region.
pub(crate) struct LineState {
	pub(crate) buf: heapless::Vec<u8, LINE_BUFFER>,
	/// Byte offset where the unconsumed field region starts.
	pub(crate) fields: usize,
}

/// All interior-mutable runtime state. Borrows never cross a suspension
/// point.
pub(crate) struct Inner {
	pub(crate) at: AtState,
	pub(crate) line: LineState,
	/// Socket receiving the binary segment in progress, if bound.
	pub(crate) rx_sock: Option<usize>,
	/// Bytes of binary data still owed by the module.
	pub(crate) rx_len: usize,
	/// Socket processing order: tail-append, removal only in the sweep.
	pub(crate) order: heapless::Vec<u8, MAX_SOCKETS>,
	/// Message processing order.
	pub(crate) msg_order: heapless::Vec<u8, MAX_MESSAGES>,
	pub(crate) modem_status: ModemStatus,
	pub(crate) gsm_status: GsmStatus,
	pub(crate) sim_status: SimStatus,
	pub(crate) tcp_status: TcpStatus,
	pub(crate) net_info: NetworkInfo,
	pub(crate) rssi: i8,
	pub(crate) at_timeout: Duration,
	pub(crate) connect_timeout: Duration,
	pub(crate) disconnect_timeout: Duration,
	pub(crate) power_off_timeout: Duration,
	pub(crate) require_location: bool,
	pub(crate) location: Location,
	pub(crate) location_text: heapless::String<MAX_LOCATION>,
	pub(crate) vendor: SimComState,
}

//******************************************************************************
// Constants
//******************************************************************************

/// Number of socket slots in the arena.
pub(crate) const MAX_SOCKETS: usize = 4;

/// Number of message slots in the arena.
pub(crate) const MAX_MESSAGES: usize = 4;

/// Capacity of each serial pipe.
pub(crate) const SERIAL_BUFFER: usize = 1024;

/// Longest response line kept for parsing; longer lines are truncated.
pub(crate) const LINE_BUFFER: usize = 256;

/// Longest formatted command body.
const CMD_BUFFER: usize = 128;

/// Capacity of the raw location response buffer.
pub(crate) const MAX_LOCATION: usize = 48;

const CTRL_Z: u8 = 0x1A;

const EV_OK: u32 = fnv1a("OK");
const EV_ERROR: u32 = fnv1a("ERROR");
const EV_CME_ERROR: u32 = fnv1a("+CME ERROR");
const EV_CMS_ERROR: u32 = fnv1a("+CMS ERROR");

/// Runtime signal bits shared between the fibers.
pub(crate) mod signal {
	/// The lifecycle task is running.
	pub const TASK_ACTIVE: u32 = 0x01;
	/// The RX task is running.
	pub const RX_TASK_ACTIVE: u32 = 0x02;
	/// Network attached and connections allowed.
	pub const NETWORK_ACTIVE: u32 = 0x04;
	/// Teardown in progress; suppress registration status updates.
	pub const NETWORK_DISCONNECTING: u32 = 0x08;
	/// The AT channel is held by a command exchange.
	pub const AT_LOCK: u32 = 0x10;
	/// There are live sockets or pending messages.
	pub const REQUIRE_ACTIVE: u32 = 0x20;
	/// Processing requested; consumed by the scheduling loop.
	pub const PROCESS: u32 = 0x40;
	/// No sockets exist at all.
	pub const IDLE: u32 = 0x80;
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

impl NetworkInfo {
	pub(crate) fn new(mcc: u16, mnc: u16, mnc_digits: u8) -> NetworkInfo {
		NetworkInfo {
			mcc,
			mnc,
			mnc_digits,
		}
	}

	/// Mobile country code.
	pub fn mcc(&self) -> u16 {
		self.mcc
	}

	/// Mobile network code.
	pub fn mnc(&self) -> u16 {
		self.mnc
	}

	/// Number of digits the network uses for its MNC (2 or 3).
	pub fn mnc_digits(&self) -> u8 {
		self.mnc_digits
	}
}

impl<'a> Modem<'a> {
	/// Create a driver instance using the given configuration hooks.
	///
	/// Nothing happens until [`Modem::run`] is spawned and a socket or
	/// message asks for the module.
	pub fn new(options: &'a dyn ModemOptions) -> Modem<'a> {
		Modem {
			options,
			st: RefCell::new(Inner::new()),
			signals: FlagCell::new(signal::IDLE),
			at_notify: Notify::new(),
			state_notify: Notify::new(),
			sockets: [
				SocketSlot::new(),
				SocketSlot::new(),
				SocketSlot::new(),
				SocketSlot::new(),
			],
			messages: [
				MessageSlot::new(),
				MessageSlot::new(),
				MessageSlot::new(),
				MessageSlot::new(),
			],
			serial_rx: Pipe::new(),
			serial_tx: Pipe::new(),
		}
	}

	/// Writing end of the serial receive pipe, for the UART glue to feed
	/// bytes arriving from the module.
	pub fn link_input(&self) -> PipeWriter<'_, SERIAL_BUFFER> {
		self.serial_rx.writer()
	}

	/// Reading end of the serial transmit pipe, for the UART glue to drain
	/// bytes towards the module.
	pub fn link_output(&self) -> PipeReader<'_, SERIAL_BUFFER> {
		self.serial_tx.reader()
	}

	/// Current module/command-channel status.
	pub fn modem_status(&self) -> ModemStatus {
		self.st.borrow().modem_status
	}

	/// Current network registration status.
	pub fn gsm_status(&self) -> GsmStatus {
		self.st.borrow().gsm_status
	}

	/// Current SIM status.
	pub fn sim_status(&self) -> SimStatus {
		self.st.borrow().sim_status
	}

	/// Current packet-data status.
	pub fn tcp_status(&self) -> TcpStatus {
		self.st.borrow().tcp_status
	}

	/// Most recent signal strength in dBm, 0 when unknown.
	pub fn rssi(&self) -> i8 {
		self.st.borrow().rssi
	}

	/// Identity of the network the module sees.
	pub fn network_info(&self) -> NetworkInfo {
		self.st.borrow().net_info
	}

	/// Most recent cell-based position, zero until one was obtained.
	pub fn location(&self) -> Location {
		self.st.borrow().location
	}

	/// Raw text of the most recent location response.
	pub fn location_text(&self) -> heapless::String<MAX_LOCATION> {
		self.st.borrow().location_text.clone()
	}

	/// Ask the runtime to obtain a cell-based position during the next
	/// lifecycle pass.
	pub fn request_location(&self) {
		debug!("requesting location");
		self.st.borrow_mut().require_location = true;
		self.ensure_running();
	}

	/// Whether the lifecycle task is running.
	pub fn is_active(&self) -> bool {
		self.signals.any(signal::TASK_ACTIVE)
	}

	/// Whether network teardown is in progress.
	pub fn is_disconnecting(&self) -> bool {
		self.signals.any(signal::NETWORK_DISCONNECTING)
	}

	/// Deadline for a single AT exchange.
	pub fn at_timeout(&self) -> Duration {
		self.st.borrow().at_timeout
	}

	/// Change the deadline for a single AT exchange.
	pub fn set_at_timeout(&self, timeout: Duration) {
		self.st.borrow_mut().at_timeout = timeout;
	}

	/// Suggested deadline for a socket connect.
	pub fn connect_timeout(&self) -> Duration {
		self.st.borrow().connect_timeout
	}

	/// Change the suggested deadline for a socket connect.
	pub fn set_connect_timeout(&self, timeout: Duration) {
		self.st.borrow_mut().connect_timeout = timeout;
	}

	/// Suggested deadline for a socket disconnect.
	pub fn disconnect_timeout(&self) -> Duration {
		self.st.borrow().disconnect_timeout
	}

	/// Change the suggested deadline for a socket disconnect.
	pub fn set_disconnect_timeout(&self, timeout: Duration) {
		self.st.borrow_mut().disconnect_timeout = timeout;
	}

	/// How long the runtime idles with no work before powering off.
	pub fn power_off_timeout(&self) -> Duration {
		self.st.borrow().power_off_timeout
	}

	/// Change the idle period before power-off.
	pub fn set_power_off_timeout(&self, timeout: Duration) {
		self.st.borrow_mut().power_off_timeout = timeout;
	}

	/// Wait for the module to be powered on and receiving.
	pub async fn wait_for_power_on(&self, timeout: Duration) -> bool {
		self.signals
			.wait_timeout(timeout, |s| {
				(s & signal::RX_TASK_ACTIVE != 0).then_some(())
			})
			.await
			.is_some()
	}

	/// Wait for every socket to be gone.
	pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
		self.signals
			.wait_timeout(timeout, |s| (s & signal::IDLE != 0).then_some(()))
			.await
			.is_some()
	}

	/// Wait for the lifecycle task to stop.
	pub async fn wait_for_power_off(&self, timeout: Duration) -> bool {
		self.signals
			.wait_timeout(timeout, |s| (s & signal::TASK_ACTIVE == 0).then_some(()))
			.await
			.is_some()
	}

	/// Wait for the network to come up.
	///
	/// Returns `false` right away when the lifecycle task is not running;
	/// otherwise waits until the network activates or the task stops, and
	/// reports whether it is active.
	pub async fn network_active(&self, timeout: Duration) -> bool {
		if !self.signals.any(signal::TASK_ACTIVE) {
			return false;
		}
		let _ = self
			.signals
			.wait_timeout(timeout, |s| {
				(s & (signal::TASK_ACTIVE | signal::NETWORK_ACTIVE) != signal::TASK_ACTIVE)
					.then_some(())
			})
			.await;
		self.signals.any(signal::NETWORK_ACTIVE)
	}

	/// Create a socket to `host:port`, optionally over TLS.
	///
	/// The returned handle holds the application reference; the connection
	/// is attempted by the runtime and observable through
	/// [`Socket::connect`].
	pub fn create_socket(&self, host: &str, port: u16, tls: bool) -> Result<Socket<'_>, Error> {
		let index = self
			.sockets
			.iter()
			.position(|slot| slot.is_free())
			.ok_or(Error::TooManySockets)?;
		let slot = &self.sockets[index];
		let mut name: heapless::String<{ socket::MAX_HOST }> = heapless::String::new();
		name.push_str(host).map_err(|_| Error::HostnameTooLong)?;
		slot.rx.reset();
		slot.tx.reset();
		*slot.host.borrow_mut() = name;
		slot.port.set(port);
		slot.channel.set(0);
		slot.outgoing.set(0);
		slot.last_sent.set(0);
		slot.error.set(false);
		slot.flags.replace(
			socket::flag::APP_REFERENCE | if tls { socket::flag::APP_SECURE } else { 0 },
		);
		let _ = self.st.borrow_mut().order.push(index as u8);
		self.signals.set(signal::REQUIRE_ACTIVE);
		self.signals.clear(signal::IDLE);
		self.ensure_running();
		debug!("socket {} to {}:{} created", index, host, port);
		Ok(Socket::new(self, index))
	}

	/// Queue an SMS to `recipient`.
	///
	/// The returned handle can wait for the outcome; release it once done.
	pub fn send_message(&self, recipient: &str, text: &str) -> Result<Message<'_>, Error> {
		let index = self
			.messages
			.iter()
			.position(|slot| slot.is_free())
			.ok_or(Error::TooManyMessages)?;
		let slot = &self.messages[index];
		let mut rcpt: heapless::String<{ message::MAX_RECIPIENT }> = heapless::String::new();
		rcpt.push_str(recipient).map_err(|_| Error::MessageTooLong)?;
		let mut body: heapless::String<{ message::MAX_TEXT }> = heapless::String::new();
		body.push_str(text).map_err(|_| Error::MessageTooLong)?;
		*slot.recipient.borrow_mut() = rcpt;
		*slot.text.borrow_mut() = body;
		slot.reference.set(-1);
		slot.flags
			.replace(message::flag::APP_REFERENCE | message::flag::MODEM_WILL_SEND);
		let _ = self.st.borrow_mut().msg_order.push(index as u8);
		self.signals.set(signal::REQUIRE_ACTIVE);
		self.ensure_running();
		debug!("message {} to {} created", index, recipient);
		Ok(Message::new(self, index))
	}

	/// Run the driver. Spawn this on the executor before using the API;
	/// it never returns.
	///
	/// The lifecycle starts whenever work appears and powers the module
	/// back off once it has been idle past the power-off timeout.
	pub async fn run(&self, hardware: &mut impl ModemHardware) -> ! {
		loop {
			self.signals
				.wait(|s| (s & signal::PROCESS != 0).then_some(()))
				.await;
			self.signals.set(signal::TASK_ACTIVE);
			if !self.task(hardware).await {
				// stop for good until the next external request
				self.signals.clear(signal::PROCESS);
			}
		}
	}
}

//******************************************************************************
// Private Functions and Impl on Private Types
//******************************************************************************

impl<'a> Modem<'a> {
	pub(crate) fn socket_slot(&self, index: usize) -> &SocketSlot {
		&self.sockets[index]
	}

	pub(crate) fn message_slot(&self, index: usize) -> &MessageSlot {
		&self.messages[index]
	}

	/// Ask the scheduling loop for another pass. Requests coalesce.
	pub(crate) fn request_processing(&self) {
		self.signals.set(signal::PROCESS);
	}

	/// Wake the lifecycle task, starting it if it is not running.
	pub(crate) fn ensure_running(&self) {
		self.request_processing();
		self.signals.set(signal::TASK_ACTIVE);
	}

	pub(crate) fn release_socket(&self, index: usize) {
		let slot = &self.sockets[index];
		debug_assert!(slot.flags.any(socket::flag::APP_REFERENCE));
		debug!("socket {} released by app", index);
		let flags = slot.flags.get();
		slot.flags
			.replace((flags & !socket::flag::APP_REFERENCE) | socket::flag::APP_CLOSE);
		self.ensure_running();
	}

	pub(crate) fn release_message(&self, index: usize) {
		let slot = &self.messages[index];
		debug_assert!(slot.flags.any(message::flag::APP_REFERENCE));
		debug!("message {} released by app", index);
		slot.flags.clear(message::flag::APP_REFERENCE);
		self.ensure_running();
	}

	/// Bind the next binary segment to a socket (or to nowhere, meaning
	/// the bytes get discarded).
	pub(crate) fn receive_for_socket(&self, sock: Option<usize>, len: usize) {
		let mut st = self.st.borrow_mut();
		st.rx_sock = sock;
		st.rx_len = len;
	}

	pub(crate) fn set_modem_status(&self, status: ModemStatus) {
		self.st.borrow_mut().modem_status = status;
	}

	pub(crate) fn set_gsm_status(&self, status: GsmStatus) {
		self.st.borrow_mut().gsm_status = status;
	}

	pub(crate) fn set_sim_status(&self, status: SimStatus) {
		self.st.borrow_mut().sim_status = status;
	}

	pub(crate) fn set_tcp_status(&self, status: TcpStatus) {
		self.st.borrow_mut().tcp_status = status;
	}

	pub(crate) fn set_network_info(&self, info: NetworkInfo) {
		self.st.borrow_mut().net_info = info;
	}

	pub(crate) fn set_rssi(&self, rssi: i8) {
		self.st.borrow_mut().rssi = rssi;
	}

	pub(crate) fn power_diagnostic(&self, kind: CallbackType, msg: &[u8]) {
		self.options.diagnostic(kind, msg);
	}

	//--------------------------------------------------------------------------
	// AT channel
	//--------------------------------------------------------------------------

	/// Take the AT channel for one command exchange.
	///
	/// Returns `true` when the channel cannot be used because a previous
	/// command broke the protocol ordering; callers treat that as a fatal
	/// shortcut. Re-acquiring an already held lock succeeds without
	/// effect, so command helpers can be chained.
	pub(crate) async fn at_lock(&self) -> bool {
		if self.signals.any(signal::AT_LOCK) {
			// the lifecycle task is the only issuer, so this is re-entry
			return false;
		}
		if self.st.borrow().modem_status == ModemStatus::CommandError {
			self.st.borrow_mut().at.result = AtResult::Failure;
			return true;
		}
		self.signals.acquire(signal::AT_LOCK).await;
		let mut st = self.st.borrow_mut();
		st.at.result = AtResult::Pending;
		st.at.require = 1;
		st.at.complete = 0;
		false
	}

	/// One-shot deadline override for the next command. Only valid while
	/// holding the AT lock.
	pub(crate) fn next_at_timeout(&self, timeout: Duration) {
		debug_assert!(self.signals.any(signal::AT_LOCK));
		self.st.borrow_mut().at.next_timeout = Some(timeout);
	}

	/// One-shot response delegate and require mask for the next command.
	/// Only valid while holding the AT lock.
	pub(crate) fn next_at_response(&self, handler: ResponseHandler, mask: u8) {
		debug_assert!(self.signals.any(signal::AT_LOCK));
		let mut st = self.st.borrow_mut();
		st.at.response = Some(handler);
		st.at.require = mask;
	}

	/// Bind socket data to the next transmit prompt. Only valid while
	/// holding the AT lock.
	pub(crate) fn next_at_transmit_socket(&self, index: usize, len: usize) {
		debug_assert!(self.signals.any(signal::AT_LOCK));
		debug_assert!(len > 0);
		self.st.borrow_mut().at.transmit = Transmit::Socket { index, len };
	}

	/// Bind message text to the next transmit prompt. Only valid while
	/// holding the AT lock.
	pub(crate) fn next_at_transmit_message(&self, index: usize) {
		debug_assert!(self.signals.any(signal::AT_LOCK));
		self.st.borrow_mut().at.transmit = Transmit::Message { index };
	}

	/// Mark part of the require mask complete; the command finishes once
	/// the whole mask has accumulated.
	pub(crate) fn at_complete(&self, mask: u8) {
		let mut st = self.st.borrow_mut();
		if st.at.result != AtResult::Pending {
			debug_assert!(false, "completion without a pending command");
			return;
		}
		st.at.complete |= mask;
		if st.at.complete & st.at.require == st.at.require {
			st.at.result = AtResult::Ok;
			drop(st);
			self.at_notify.wake();
		}
	}

	/// Execute a plain AT command.
	pub(crate) async fn at(&self, cmd: &str) -> AtResult {
		if self.at_lock().await {
			return AtResult::Failure;
		}
		self.at_send(cmd).await
	}

	/// Execute a formatted AT command.
	pub(crate) async fn at_fmt(&self, args: core::fmt::Arguments<'_>) -> AtResult {
		if self.at_lock().await {
			return AtResult::Failure;
		}
		let mut body: heapless::String<CMD_BUFFER> = heapless::String::new();
		if write!(body, "{}", args).is_err() {
			warn!("AT command too long");
			return self.at_write_failed();
		}
		self.at_send(&body).await
	}

	async fn at_send(&self, body: &str) -> AtResult {
		trace!(">> AT{}", body);
		let mut cmd: heapless::String<CMD_BUFFER> = heapless::String::new();
		if write!(cmd, "AT{}", body).is_err() {
			warn!("AT command too long");
			return self.at_write_failed();
		}
		self.options
			.diagnostic(CallbackType::CommandSend, cmd.as_bytes());
		let tx = self.serial_tx.writer();
		if !tx.write_all(cmd.as_bytes()).await || !tx.write_all(b"\r").await {
			return self.at_write_failed();
		}
		self.at_response().await
	}

	/// The transmit pipe refused the command; poison the channel.
	fn at_write_failed(&self) -> AtResult {
		{
			let mut st = self.st.borrow_mut();
			st.at.next_timeout = None;
			st.at.response = None;
			st.at.transmit = Transmit::None;
			st.at.result = AtResult::Failure;
			st.modem_status = ModemStatus::CommandError;
		}
		self.signals.clear(signal::AT_LOCK);
		self.at_notify.wake();
		AtResult::Failure
	}

	/// Wait for the command in flight to reach a terminal state, then
	/// release the channel.
	async fn at_response(&self) -> AtResult {
		debug_assert!(self.signals.any(signal::AT_LOCK));
		let timeout = {
			let mut st = self.st.borrow_mut();
			st.at.next_timeout.take().unwrap_or(st.at_timeout)
		};
		let outcome = wait::with_opt_timeout(
			timeout,
			self.at_notify.until(|| {
				let st = self.st.borrow();
				(st.at.result != AtResult::Pending).then_some(st.at.result)
			}),
		)
		.await;
		let result = match outcome {
			Some(result) => result,
			None => {
				let mut st = self.st.borrow_mut();
				st.modem_status = ModemStatus::CommandError;
				st.at.result = AtResult::Timeout;
				AtResult::Timeout
			}
		};
		{
			let mut st = self.st.borrow_mut();
			st.at.response = None;
			st.at.transmit = Transmit::None;
		}
		self.signals.clear(signal::AT_LOCK);
		result
	}

	//--------------------------------------------------------------------------
	// RX task
	//--------------------------------------------------------------------------

	/// Consume the serial stream until it closes: complete commands,
	/// dispatch events and stream binary segments.
	pub(crate) async fn rx_task(&self) {
		let rx = self.serial_rx.reader();
		loop {
			if rx.require(1).await == 0 {
				break;
			}
			match rx.peek(0) {
				b'>' => {
					rx.advance(1);
					self.transmit_prompt().await;
				}
				b'\r' | b'\n' | b' ' => rx.advance(1),
				_ => {
					let len = rx.require_until(b'\r').await;
					if len == 0 {
						if rx.is_complete() {
							rx.advance(rx.available());
						}
						continue;
					}
					self.take_line(rx, len);
					self.dispatch_line().await;
					self.state_notify.wake();
					self.pump_binary(rx).await;
				}
			}
		}
		debug!("rx stopped");
		self.signals.clear(signal::RX_TASK_ACTIVE);
	}

	/// Copy one line (without its CR) out of the pipe and consume it.
	fn take_line(&self, rx: PipeReader<'_, SERIAL_BUFFER>, len: usize) {
		let content = len - 1;
		let copy = content.min(LINE_BUFFER);
		{
			let mut st = self.st.borrow_mut();
			st.line.buf.clear();
			let _ = st.line.buf.resize(copy, 0);
			rx.peek_copy(&mut st.line.buf[..]);
			st.line.fields = 0;
		}
		if content > LINE_BUFFER {
			warn!("response line truncated ({} bytes)", content);
		}
		rx.advance(len);
		let st = self.st.borrow();
		self.options
			.diagnostic(CallbackType::CommandReceive, &st.line.buf);
		if let Ok(text) = core::str::from_utf8(&st.line.buf) {
			trace!("<< {}", text);
		}
	}

	/// Classify the captured line and drive command or event handling.
	async fn dispatch_line(&self) {
		let (hash, fields) = {
			let st = self.st.borrow();
			scan_event(&st.line.buf)
		};
		match hash {
			EV_OK => {
				if self.st.borrow().at.result == AtResult::Pending {
					self.at_complete(1);
				} else {
					warn!("unexpected OK");
				}
			}
			EV_ERROR | EV_CME_ERROR | EV_CMS_ERROR => {
				let pending = {
					let mut st = self.st.borrow_mut();
					if st.at.result == AtResult::Pending {
						st.at.result = AtResult::Error;
						true
					} else {
						false
					}
				};
				if pending {
					self.at_notify.wake();
					// let the issuing fiber inspect the error line before
					// the next one replaces it
					yield_now().await;
				} else {
					warn!("unexpected error response");
				}
			}
			_ => {
				self.st.borrow_mut().line.fields = fields;
				if !self.on_event(hash) {
					let (pending, handler) = {
						let st = self.st.borrow();
						(st.at.result == AtResult::Pending, st.at.response)
					};
					if !pending {
						warn!("unexpected event");
					} else if let Some(handler) = handler {
						self.run_response(handler, hash);
					} else {
						warn!("unexpected AT response");
					}
				}
			}
		}
	}

	/// Stream the announced binary segment into the bound socket, or
	/// discard it when nothing is bound.
	async fn pump_binary(&self, rx: PipeReader<'_, SERIAL_BUFFER>) {
		let (len, sock) = {
			let st = self.st.borrow();
			(st.rx_len, st.rx_sock)
		};
		if len == 0 {
			return;
		}
		if rx.require(1).await > 0 {
			if rx.peek(0) != b'\n' {
				warn!("CRLF expected before incoming data");
			}
			rx.advance(1);
		}
		match sock {
			Some(index) => trace!("socket {} receiving {} bytes", index, len),
			None => trace!("skipping {} unbound bytes", len),
		}
		let mut remaining = len;
		while remaining > 0 {
			let mut avail = rx.require(1).await;
			if avail == 0 {
				break;
			}
			// gather at least one full segment before moving, so large
			// transfers stream segment-at-a-time
			while avail < remaining && !rx.available_full_segment() {
				let need = avail + 1;
				avail = rx.require(need).await;
				if avail < need {
					break;
				}
			}
			let chunk = remaining.min(avail);
			match sock {
				Some(index) => {
					let writer = self.sockets[index].rx.writer();
					let moved = rx.move_to(writer, chunk).await;
					if moved < chunk {
						// socket input closed under us, discard the rest
						rx.advance(chunk - moved);
					}
				}
				None => rx.advance(chunk),
			}
			remaining -= chunk;
		}
		{
			let mut st = self.st.borrow_mut();
			st.rx_len = 0;
			st.rx_sock = None;
		}
		self.request_processing();
	}

	/// Feed the module whatever the armed transmit binding holds.
	async fn transmit_prompt(&self) {
		let transmit = {
			let mut st = self.st.borrow_mut();
			core::mem::replace(&mut st.at.transmit, Transmit::None)
		};
		match transmit {
			Transmit::Socket { index, len } => {
				let slot = &self.sockets[index];
				trace!("socket {} transmitting {} bytes", index, len);
				let sent = slot
					.tx
					.reader()
					.copy_to(self.serial_tx.writer(), 0, len)
					.await;
				debug_assert!(sent == len);
			}
			Transmit::Message { index } => {
				let text = self.messages[index].text.borrow().clone();
				trace!("message {} transmitting {} bytes", index, text.len());
				let tx = self.serial_tx.writer();
				let sent = tx.write_all(text.as_bytes()).await;
				debug_assert!(sent);
				let sent = tx.write_all(&[CTRL_Z]).await;
				debug_assert!(sent);
			}
			Transmit::None => warn!("unexpected transmit prompt"),
		}
	}

	//--------------------------------------------------------------------------
	// Lifecycle task
	//--------------------------------------------------------------------------

	/// One full lifecycle pass. Returns whether a re-armed processing
	/// request may restart it right away.
	async fn task(&self, hardware: &mut impl ModemHardware) -> bool {
		trace!("preprocessing sockets");
		let mut need = false;
		for index in self.socket_order() {
			let slot = &self.sockets[index];
			if slot.is_free() {
				continue;
			}
			if slot.flags.any(socket::flag::APP_CLOSE) {
				// closure requested while powered off, nothing to undo
				slot.finished();
			} else if slot.is_new() {
				trace!("socket {} is alive, will power on", index);
				need = true;
			} else {
				debug_assert!(slot.is_closed());
			}
		}
		self.destroy_deletable_sockets();
		self.destroy_deletable_messages();

		if !need && self.st.borrow().msg_order.is_empty() {
			trace!("no active sockets or messages, not starting");
			self.signals.clear(signal::TASK_ACTIVE);
			return false;
		}

		self.request_processing();

		self.power_diagnostic(CallbackType::PowerSend, b"ON");
		if !self.power_on_impl(hardware).await {
			self.power_diagnostic(CallbackType::PowerReceive, b"ERR");
			self.set_modem_status(ModemStatus::PowerOnFailure);
			debug!("power on failed, retrying in 10 seconds");
			Timer::after(Duration::from_secs(10)).await;
			if !self.power_on_impl(hardware).await {
				self.power_diagnostic(CallbackType::PowerReceive, b"FAIL");
				self.finish_all_sockets();
				self.signals.clear(signal::TASK_ACTIVE);
				return false;
			}
		}
		self.power_diagnostic(CallbackType::PowerReceive, b"ON");
		self.options.on_power_on();

		debug!("starting rx");
		debug_assert!(!self.signals.any(signal::RX_TASK_ACTIVE));
		self.signals.clear(signal::NETWORK_DISCONNECTING);
		self.signals.set(signal::RX_TASK_ACTIVE);
		join(self.rx_task(), self.lifecycle(hardware)).await;

		self.signals.clear(signal::TASK_ACTIVE);
		debug!("stopped");
		true
	}

	/// Everything between power-on and power-off, run beside the RX task.
	async fn lifecycle(&self, hardware: &mut impl ModemHardware) {
		if self.start_impl(hardware).await {
			self.set_modem_status(ModemStatus::Ok);
			if self.unlock_sim_impl().await {
				self.set_sim_status(SimStatus::Ok);
				if self.connect_network_impl().await {
					self.set_gsm_status(GsmStatus::Ok);
					self.signals.set(signal::NETWORK_ACTIVE);
					self.processing_loop().await;
					if self.st.borrow().require_location {
						self.fetch_location().await;
					}
					self.signals.clear(signal::NETWORK_ACTIVE);
					self.signals.set(signal::NETWORK_DISCONNECTING);
					self.disconnect_network_impl().await;
				}
			}
			self.stop_impl().await;
		}

		self.finish_all_sockets();

		self.power_diagnostic(CallbackType::PowerSend, b"OFF");
		self.power_off_impl(hardware).await;
		self.serial_tx.close();
		self.options.on_power_off();
		self.power_diagnostic(CallbackType::PowerReceive, b"OFF");

		// the RX task exits once the receive pipe has drained and closed
		self.signals
			.wait(|s| (s & signal::RX_TASK_ACTIVE == 0).then_some(()))
			.await;
	}

	/// The per-iteration scheduling loop: closes, sweeps, connects, sends,
	/// receives and message work, until the AT channel breaks or the
	/// driver has been idle past the power-off timeout.
	async fn processing_loop(&self) {
		loop {
			self.signals.consume(signal::PROCESS).await;
			trace!("processing");

			// socket closures first, so their channels free up
			for index in self.socket_order() {
				if self.binary_transfer_pending() {
					break;
				}
				let slot = &self.sockets[index];
				if slot.is_free() {
					continue;
				}
				if slot.needs_close() {
					slot.flags.set(socket::flag::MODEM_CLOSING);
					debug!("closing socket {}", index);
					self.close_impl(index).await;
				}
			}

			self.destroy_deletable_sockets();

			for index in self.socket_order() {
				if self.binary_transfer_pending() {
					break;
				}
				let slot = &self.sockets[index];
				if slot.is_free() {
					continue;
				}
				if !slot.is_allocated() {
					self.try_allocate_impl(index);
				}
				if slot.needs_connect() {
					slot.flags.set(socket::flag::MODEM_CONNECTING);
					self.connect_impl(index).await;
				}
				if slot.data_to_send() {
					self.send_packet_impl(index).await;
					// always continue processing after a send attempt
					self.request_processing();
				}
				if slot.data_to_receive() {
					if slot.can_receive() {
						self.receive_packet_impl(index).await;
					} else {
						// poll until the input pipe has room again
						self.request_processing();
					}
				}
				if slot.data_to_check() && slot.can_receive() {
					self.check_incoming_impl(index).await;
				}
			}

			for index in self.message_order() {
				if self.binary_transfer_pending() {
					break;
				}
				let slot = &self.messages[index];
				if slot.is_free() {
					continue;
				}
				if slot.should_send() {
					if !self.send_message_impl(index).await {
						slot.sending_failed();
					}
					self.request_processing();
				}
			}

			self.destroy_deletable_messages();

			if self.st.borrow().at.result != AtResult::Ok {
				debug!("AT sequence broken");
				break;
			}

			let (no_work, power_off_timeout) = {
				let st = self.st.borrow();
				(
					st.order.is_empty() && st.msg_order.is_empty(),
					st.power_off_timeout,
				)
			};
			if no_work {
				self.signals.clear(signal::REQUIRE_ACTIVE);
				let activity = self
					.signals
					.wait_timeout(power_off_timeout, |s| {
						(s & signal::REQUIRE_ACTIVE != 0).then_some(())
					})
					.await;
				if activity.is_none() {
					debug!("no activity for a while, turning off modem");
					// further processing requests restart the lifecycle
					self.signals.clear(signal::PROCESS);
					break;
				}
			} else {
				yield_now().await;
			}
		}
	}

	/// Obtain a position fix and parse `code,lat,lon,accuracy`.
	async fn fetch_location(&self) {
		self.get_location_impl().await;
		let text = self.st.borrow().location_text.clone();
		let mut parts = text.split(',');
		let code = parts.next().unwrap_or("");
		let lat = parts.next().unwrap_or("");
		let lon = parts.next().unwrap_or("");
		if code == "0" {
			let location = Location {
				lat: parse_location_int(lat),
				lon: parse_location_int(lon),
			};
			self.st.borrow_mut().location = location;
			debug!("location: {},{}", location.lat, location.lon);
		}
	}

	fn binary_transfer_pending(&self) -> bool {
		self.st.borrow().rx_len > 0
	}

	pub(crate) fn socket_order(&self) -> heapless::Vec<usize, MAX_SOCKETS> {
		self.st
			.borrow()
			.order
			.iter()
			.map(|&id| id as usize)
			.collect()
	}

	fn message_order(&self) -> heapless::Vec<usize, MAX_MESSAGES> {
		self.st
			.borrow()
			.msg_order
			.iter()
			.map(|&id| id as usize)
			.collect()
	}

	fn destroy_deletable_sockets(&self) {
		let mut st = self.st.borrow_mut();
		let mut i = 0;
		while i < st.order.len() {
			let index = st.order[i] as usize;
			if self.sockets[index].can_delete() {
				debug!("socket {} destroyed", index);
				self.sockets[index].recycle();
				st.order.remove(i);
			} else {
				i += 1;
			}
		}
		let idle = st.order.is_empty();
		drop(st);
		if idle {
			self.signals.set(signal::IDLE);
		}
	}

	fn destroy_deletable_messages(&self) {
		let mut st = self.st.borrow_mut();
		let mut i = 0;
		while i < st.msg_order.len() {
			let index = st.msg_order[i] as usize;
			if self.messages[index].can_delete() {
				debug!("message {} destroyed", index);
				self.messages[index].recycle();
				st.msg_order.remove(i);
			} else {
				i += 1;
			}
		}
	}

	fn finish_all_sockets(&self) {
		for index in self.socket_order() {
			if !self.sockets[index].is_free() {
				self.sockets[index].finished();
			}
		}
	}
}

impl Inner {
	fn new() -> Inner {
		Inner {
			at: AtState {
				result: AtResult::Ok,
				require: 1,
				complete: 0,
				next_timeout: None,
				response: None,
				transmit: Transmit::None,
			},
			line: LineState {
				buf: heapless::Vec::new(),
				fields: 0,
			},
			rx_sock: None,
			rx_len: 0,
			order: heapless::Vec::new(),
			msg_order: heapless::Vec::new(),
			modem_status: ModemStatus::Ok,
			gsm_status: GsmStatus::Ok,
			sim_status: SimStatus::Ok,
			tcp_status: TcpStatus::Ok,
			net_info: NetworkInfo::default(),
			rssi: 0,
			at_timeout: Duration::from_secs(5),
			connect_timeout: Duration::from_secs(30),
			disconnect_timeout: Duration::from_secs(10),
			power_off_timeout: FOREVER,
			require_location: false,
			location: Location::default(),
			location_text: heapless::String::new(),
			vendor: SimComState::new(),
		}
	}

	/// Remaining unconsumed field region of the current line.
	fn field_region(&self) -> &[u8] {
		&self.line.buf[self.line.fields.min(self.line.buf.len())..]
	}

	/// Whether the raw line matches `text` starting at byte `offset`.
	pub(crate) fn line_matches(&self, text: &str, offset: usize) -> bool {
		self.line.buf.len() >= offset + text.len()
			&& &self.line.buf[offset..offset + text.len()] == text.as_bytes()
	}

	/// Byte `offset` of the raw line, 0 when out of range.
	pub(crate) fn line_peek(&self, offset: usize) -> u8 {
		self.line.buf.get(offset).copied().unwrap_or(0)
	}

	/// Whether the field region matches `text` starting at byte `offset`.
	pub(crate) fn field_matches(&self, text: &str, offset: usize) -> bool {
		let fields = self.field_region();
		fields.len() >= offset + text.len()
			&& &fields[offset..offset + text.len()] == text.as_bytes()
	}

	/// Count the comma-separated fields left in the region.
	pub(crate) fn field_count(&self) -> usize {
		let fields = self.field_region();
		if fields.is_empty() {
			0
		} else {
			fields.iter().filter(|&&c| c == b',').count() + 1
		}
	}

	/// Parse one signed decimal field, consuming it.
	pub(crate) fn field_num(&mut self) -> Option<i32> {
		let (clean, _, value) = self.field_num_raw(10);
		clean.then_some(value)
	}

	/// Parse one signed hexadecimal field, consuming it.
	pub(crate) fn field_hex(&mut self) -> Option<i32> {
		let (clean, _, value) = self.field_num_raw(16);
		clean.then_some(value)
	}

	/// Parse a decimal field, accepting trailing junk before the next
	/// comma; succeeds as soon as one digit was seen. Needed for lines
	/// like `+RECEIVE,0,5:` where a colon trails the last number.
	pub(crate) fn field_num_lenient(&mut self) -> Option<i32> {
		let (_, has_digit, value) = self.field_num_raw(10);
		has_digit.then_some(value)
	}

	/// Numeric field scan. Returns (clean, saw-a-digit, value) where clean
	/// means at least one digit and no stray characters before the comma.
	/// Quotes are transparent, so `"ABCD"` hex-parses to 0xABCD.
	fn field_num_raw(&mut self, base: i32) -> (bool, bool, i32) {
		let buf = &self.line.buf;
		let mut i = self.line.fields.min(buf.len());
		let end = buf.len();
		while i < end && buf[i] == b'"' {
			i += 1;
		}
		let mut negative = false;
		if i < end && (buf[i] == b'+' || buf[i] == b'-') {
			negative = buf[i] == b'-';
			i += 1;
		}
		let mut value: i32 = 0;
		let mut has_digit = false;
		let mut error = false;
		while i < end {
			let c = buf[i];
			if c == b'"' {
				i += 1;
				continue;
			}
			let digit = match c {
				b'0'..=b'9' => i32::from(c - b'0'),
				b'a'..=b'z' => i32::from(c - b'a') + 10,
				b'A'..=b'Z' => i32::from(c - b'A') + 10,
				_ => break,
			};
			if digit >= base {
				error = true;
				break;
			}
			value = value.wrapping_mul(base).wrapping_add(digit);
			has_digit = true;
			i += 1;
		}
		// skip whatever is left of the field
		while i < end {
			let eof = buf[i] == b',';
			i += 1;
			if eof {
				break;
			}
			error = true;
		}
		self.line.fields = i;
		if negative {
			value = -value;
		}
		(has_digit && !error, has_digit, value)
	}

	/// Hash one field's text, consuming it.
	pub(crate) fn field_fnv(&mut self) -> u32 {
		let buf = &self.line.buf;
		let mut i = self.line.fields.min(buf.len());
		let mut hash = Fnv1a::new();
		while i < buf.len() {
			let c = buf[i];
			i += 1;
			if c == b',' {
				break;
			}
			hash.add(c);
		}
		self.line.fields = i;
		hash.value()
	}

	/// Copy the rest of the field region into a bounded string.
	pub(crate) fn field_rest(&self) -> heapless::String<MAX_LOCATION> {
		let mut out = heapless::String::new();
		for &c in self.field_region() {
			if out.push(c as char).is_err() {
				break;
			}
		}
		out
	}
}

/// Parse a decimal number with an optional sign, skipping any dots, the
/// way the module formats latitude and longitude. `"51.5074"` becomes
/// 515074; parsing stops at the first other stray character.
pub(crate) fn parse_location_int(text: &str) -> i32 {
	let bytes = text.as_bytes();
	let mut i = 0;
	while i < bytes.len() && bytes[i].is_ascii_whitespace() {
		i += 1;
	}
	let mut negative = false;
	if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
		negative = bytes[i] == b'-';
		i += 1;
	}
	let mut value: i32 = 0;
	while i < bytes.len() {
		match bytes[i] {
			c @ b'0'..=b'9' => value = value.wrapping_mul(10).wrapping_add(i32::from(c - b'0')),
			b'.' => {}
			_ => break,
		}
		i += 1;
	}
	if negative {
		-value
	} else {
		value
	}
}

//******************************************************************************
// Tests
//******************************************************************************

#[cfg(test)]
mod test {
	use super::*;

	fn inner_with(line: &str, fields_at: usize) -> Inner {
		let mut inner = Inner::new();
		inner.line.buf.clear();
		let _ = inner.line.buf.extend_from_slice(line.as_bytes());
		inner.line.fields = fields_at;
		inner
	}

	#[test]
	fn field_num_parses_signed_decimal() {
		let mut inner = inner_with("15,-3,+7", 0);
		assert_eq!(inner.field_num(), Some(15));
		assert_eq!(inner.field_num(), Some(-3));
		assert_eq!(inner.field_num(), Some(7));
		assert_eq!(inner.field_num(), None);
	}

	#[test]
	fn field_num_rejects_stray_characters() {
		let mut inner = inner_with("5:,9", 0);
		assert_eq!(inner.field_num(), None);
		// the bad field was still consumed up to its comma
		assert_eq!(inner.field_num(), Some(9));
	}

	#[test]
	fn field_num_lenient_keeps_the_value() {
		let mut inner = inner_with("0,5:", 0);
		assert_eq!(inner.field_num(), Some(0));
		assert_eq!(inner.field_num_lenient(), Some(5));
	}

	#[test]
	fn field_num_requires_a_digit() {
		let mut inner = inner_with(",", 0);
		assert_eq!(inner.field_num(), None);
		let mut inner = inner_with("-,", 0);
		assert_eq!(inner.field_num(), None);
	}

	#[test]
	fn field_hex_parses() {
		let mut inner = inner_with("ABCD,1234", 0);
		assert_eq!(inner.field_hex(), Some(0xABCD));
		assert_eq!(inner.field_hex(), Some(0x1234));
	}

	#[test]
	fn field_hex_sees_through_quotes() {
		let mut inner = inner_with("\"ABCD\",\"1234\"", 0);
		assert_eq!(inner.field_hex(), Some(0xABCD));
		assert_eq!(inner.field_hex(), Some(0x1234));
	}

	#[test]
	fn field_count_counts_remaining() {
		let inner = inner_with("1,2,3", 0);
		assert_eq!(inner.field_count(), 3);
		let inner = inner_with("", 0);
		assert_eq!(inner.field_count(), 0);
	}

	#[test]
	fn field_fnv_hashes_token() {
		let mut inner = inner_with("DATA,0,5", 0);
		assert_eq!(inner.field_fnv(), fnv1a("DATA"));
		assert_eq!(inner.field_num(), Some(0));
	}

	#[test]
	fn location_integers() {
		assert_eq!(parse_location_int("51.5074"), 515074);
		assert_eq!(parse_location_int("-0.1278"), -1278);
		assert_eq!(parse_location_int(" +12.5"), 125);
		assert_eq!(parse_location_int("abc"), 0);
	}
}

//******************************************************************************
// End of File
//******************************************************************************
