//! # SimCom dialects for simcomlib
//!
//! Everything specific to the SIM800 (2G) and SIM7600 (4G) modules: model
//! detection, per-model command dialects, channel allocation, the network
//! attach/teardown choreography, SMS submission, cell location and the
//! unsolicited event table.
//!
//! The two dialects differ more than their shared vendor suggests. The
//! SIM800 multiplexes six channels over `+CIPSTART`-style commands and
//! pushes received data unsolicited; the SIM7600 splits TLS onto `+CCH`
//! channels that have to be polled with `+CCHRECV`. Both are handled by
//! matching on the detected [`Model`] inside each hook.
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

use embassy_time::{Duration, Timer};
use log::{debug, trace, warn};

use crate::fnv::fnv1a;
use crate::modem::{
	signal, AtResult, Modem, ModemStatus, NetworkInfo, ResponseHandler, SimStatus, TcpStatus,
};
use crate::options::{ModemHardware, Parity};
use crate::wait::with_opt_timeout;

//******************************************************************************
// Types
//******************************************************************************

/// SimCom module generations this driver recognises.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Model {
	/// Nothing identified (yet).
	Unknown,
	/// SIM800 series (2G).
	Sim800,
	/// SIM7600 series (4G).
	Sim7600,
}

/// Network registration states reported by `+CREG`/`+CGREG`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) enum Registration {
	#[default]
	None,
	Home,
	Searching,
	Denied,
	Unknown,
	Roaming,
}

/// One registration domain (voice or packet).
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct RegState {
	pub(crate) status: Registration,
	pub(crate) active: bool,
	pub(crate) lac: u16,
	pub(crate) ci: u16,
}

/// SIM unlock progress.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct SimState {
	pub(crate) pin_required: bool,
	pub(crate) pin_used: bool,
	pub(crate) ready: bool,
}

/// Voice network state.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct NetState {
	pub(crate) reg: RegState,
	pub(crate) rssi: i8,
	pub(crate) ber: i8,
	/// A `+NETOPEN:`-family event carried a nonzero code.
	pub(crate) error: bool,
}

/// Packet network state.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct GprsState {
	pub(crate) reg: RegState,
	pub(crate) attached: bool,
	pub(crate) pdp_active: bool,
}

/// Vendor-side state, reset at the start of every initialisation.
pub(crate) struct SimComState {
	pub(crate) model: Model,
	pub(crate) cfun: u8,
	pub(crate) sim: SimState,
	pub(crate) net: NetState,
	pub(crate) gprs: GprsState,
	/// Set once the PIN has been removed or rejected, so it is never
	/// presented again (a retried bad PIN would lock the card).
	pub(crate) pin_forgotten: bool,
	pub(crate) allocate_timeout: Duration,
}

//******************************************************************************
// Constants
//******************************************************************************

/// Largest chunk handed to the module in one send or receive.
const MAX_PACKET: usize = 1024;

const EV_CSQ: u32 = fnv1a("+CSQ");
const EV_CSQN: u32 = fnv1a("+CSQN");
const EV_CREG: u32 = fnv1a("+CREG");
const EV_CGREG: u32 = fnv1a("+CGREG");
const EV_CPIN: u32 = fnv1a("+CPIN");
const EV_CFUN: u32 = fnv1a("+CFUN");
const EV_CCHOPEN: u32 = fnv1a("+CCHOPEN");
const EV_CONNECT_OK: u32 = fnv1a("CONNECT OK");
const EV_CCHCLOSE: u32 = fnv1a("+CCHCLOSE");
const EV_CCH_PEER_CLOSED: u32 = fnv1a("+CCH_PEER_CLOSED");
const EV_CLOSE_OK: u32 = fnv1a("CLOSE OK");
const EV_CLOSED: u32 = fnv1a("CLOSED");
const EV_CCHRECV: u32 = fnv1a("+CCHRECV");
const EV_RECEIVE: u32 = fnv1a("+RECEIVE,");
const EV_CCHEVENT: u32 = fnv1a("+CCHEVENT");
const EV_CPSI: u32 = fnv1a("+CPSI");
const EV_CIEV: u32 = fnv1a("+CIEV");
const EV_CTZV: u32 = fnv1a("+CTZV");
const EV_COPS: u32 = fnv1a("+COPS");
const EV_IPADDR: u32 = fnv1a("+IPADDR");
const EV_PDP: u32 = fnv1a("+PDP");
const EV_RDY: u32 = fnv1a("RDY");
const EV_CALL_READY: u32 = fnv1a("Call Ready");
const EV_SMS_READY: u32 = fnv1a("SMS Ready");
const EV_PSUTTZ: u32 = fnv1a("*PSUTTZ");
const EV_DST: u32 = fnv1a("DST");
const EV_MODEL: u32 = fnv1a("Model");
const EV_DATA: u32 = fnv1a("DATA");
const EV_LEN: u32 = fnv1a("LEN");
const EV_RECV_EVENT: u32 = fnv1a("RECV EVENT");
const EV_DATA_ACCEPT: u32 = fnv1a("DATA ACCEPT");
const EV_SEND_FAIL: u32 = fnv1a("SEND FAIL");
const EV_CCHSEND: u32 = fnv1a("+CCHSEND");
const EV_CIPACK: u32 = fnv1a("+CIPACK");
const EV_CMGS: u32 = fnv1a("+CMGS");
const EV_NETOPEN: u32 = fnv1a("+NETOPEN");
const EV_NETCLOSE: u32 = fnv1a("+NETCLOSE");
const EV_CCHSTART: u32 = fnv1a("+CCHSTART");
const EV_CCHSTOP: u32 = fnv1a("+CCHSTOP");
const EV_SHUT_OK: u32 = fnv1a("SHUT OK");
const EV_NORMAL_POWER_DOWN: u32 = fnv1a("NORMAL POWER DOWN");

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

impl Model {
	fn name(self) -> &'static str {
		match self {
			Model::Unknown => "unknown",
			Model::Sim800 => "SIM800",
			Model::Sim7600 => "SIM7600",
		}
	}

	/// The highest link rate each generation runs reliably.
	fn baud_rate(self) -> u32 {
		match self {
			Model::Unknown => 115_200,
			Model::Sim800 => 460_800,
			Model::Sim7600 => 3_200_000,
		}
	}
}

impl<'a> Modem<'a> {
	/// Which module generation was detected during start-up.
	pub fn detected_model(&self) -> Model {
		self.st.borrow().vendor.model
	}

	/// How long a channel allocation may stay outstanding.
	pub fn allocate_timeout(&self) -> Duration {
		self.st.borrow().vendor.allocate_timeout
	}

	/// Change the channel allocation deadline.
	pub fn set_allocate_timeout(&self, timeout: Duration) {
		self.st.borrow_mut().vendor.allocate_timeout = timeout;
	}
}

//******************************************************************************
// Private Functions and Impl on Private Types
//******************************************************************************

impl SimComState {
	pub(crate) fn new() -> SimComState {
		SimComState {
			model: Model::Unknown,
			cfun: 0,
			sim: SimState::default(),
			net: NetState::default(),
			gprs: GprsState::default(),
			pin_forgotten: false,
			allocate_timeout: Duration::from_secs(1),
		}
	}

	/// Back to a blank slate for a fresh initialisation pass. The PIN
	/// bookkeeping survives on purpose.
	fn reset(&mut self) {
		self.model = Model::Unknown;
		self.cfun = 0;
		self.sim = SimState::default();
		self.net = NetState::default();
		self.gprs = GprsState::default();
	}
}

impl From<i32> for Registration {
	fn from(value: i32) -> Registration {
		match value {
			0 => Registration::None,
			1 => Registration::Home,
			2 => Registration::Searching,
			3 => Registration::Denied,
			5 => Registration::Roaming,
			_ => Registration::Unknown,
		}
	}
}

impl<'a> Modem<'a> {
	/// Find the socket bound to a module channel. TLS and TCP channel
	/// numbering overlaps on the SIM7600, so events from the `+CCH` family
	/// pass `Some(true)` to restrict the match.
	fn find_socket(&self, channel: u8, secure: Option<bool>) -> Option<usize> {
		self.socket_order().into_iter().find(|&index| {
			let slot = &self.sockets[index];
			slot.is_allocated()
				&& slot.channel.get() == channel
				&& secure.map_or(true, |want| slot.is_secure() == want)
		})
	}

	//--------------------------------------------------------------------------
	// Socket operations
	//--------------------------------------------------------------------------

	/// Reserve a free module channel for the socket, without blocking.
	pub(crate) fn try_allocate_impl(&self, index: usize) -> bool {
		let slot = &self.sockets[index];
		let model = self.st.borrow().vendor.model;
		let (channels, match_secure) = match model {
			// six shared TCP/TLS channels
			Model::Sim800 => (6u32, false),
			// two TLS and ten plain channels, numbered separately
			Model::Sim7600 => (if slot.is_secure() { 2 } else { 10 }, true),
			Model::Unknown => {
				debug!("unsupported modem");
				return false;
			}
		};
		let mut avail: u32 = (1 << channels) - 1;
		for other in self.socket_order() {
			let other_slot = &self.sockets[other];
			if other_slot.is_allocated()
				&& (!match_secure || other_slot.is_secure() == slot.is_secure())
			{
				avail &= !(1 << other_slot.channel.get());
			}
		}
		if avail == 0 {
			return false;
		}
		let channel = avail.trailing_zeros() as u8;
		slot.channel.set(channel);
		slot.allocate();
		debug!(
			"{} channel {} bound to socket {}",
			if slot.is_secure() { "TLS" } else { "TCP" },
			channel,
			index
		);
		true
	}

	/// Issue the dialect's connect command and bind the channel.
	pub(crate) async fn connect_impl(&self, index: usize) -> bool {
		let slot = &self.sockets[index];
		let model = self.st.borrow().vendor.model;
		let host = slot.host.borrow().clone();
		let port = slot.port.get();
		let channel = slot.channel.get();
		match model {
			Model::Sim800 => {
				if self
					.at_fmt(format_args!("+CIPSSL={}", slot.is_secure() as u8))
					.await != AtResult::Ok
				{
					self.set_tcp_status(TcpStatus::TlsError);
					slot.disconnected();
				} else if self
					.at_fmt(format_args!(
						"+CIPSTART={},\"TCP\",\"{}\",\"{}\"",
						channel, host, port
					))
					.await != AtResult::Ok
				{
					slot.disconnected();
					self.set_tcp_status(TcpStatus::ConnectionError);
				} else {
					slot.bound();
					return true;
				}
			}
			Model::Sim7600 => {
				let result = if slot.is_secure() {
					self.at_fmt(format_args!("+CCHOPEN={},\"{}\",{},2", channel, host, port))
						.await
				} else {
					self.at_fmt(format_args!(
						"+CIPOPEN={},\"TCP\",\"{}\",{}",
						channel, host, port
					))
					.await
				};
				if result == AtResult::Ok {
					slot.bound();
					return true;
				}
				slot.disconnected();
				self.set_tcp_status(TcpStatus::ConnectionError);
			}
			Model::Unknown => debug!("unsupported modem"),
		}
		false
	}

	/// Push up to one packet of buffered output to the module.
	///
	/// After a SIM800 `SEND FAIL` the module's idea of the acknowledged
	/// byte count is re-read with `+CIPACK` and the transmit cursor
	/// re-synced before anything else goes out.
	pub(crate) async fn send_packet_impl(&self, index: usize) -> bool {
		let slot = &self.sockets[index];
		let mut len = slot.tx.reader().available().min(MAX_PACKET);
		if len == 0 {
			return false;
		}
		if self.at_lock().await {
			return false;
		}
		let model = self.st.borrow().vendor.model;
		if model == Model::Sim800 && slot.error.get() {
			// check the actual ACK status after a send failure
			self.next_at_response(ResponseHandler::SendAck { socket: index }, 3);
			if self
				.at_fmt(format_args!("+CIPACK={}", slot.channel.get()))
				.await != AtResult::Ok
			{
				return false;
			}
			if slot.is_closed() {
				return false;
			}
			// the cursor may have moved, re-evaluate
			len = slot.tx.reader().available().min(MAX_PACKET);
			if len == 0 {
				return false;
			}
			if self.at_lock().await {
				return false;
			}
		}
		slot.outgoing.set(len);
		slot.last_sent.set(len);
		slot.sending();
		self.next_at_transmit_socket(index, len);
		let family = if model == Model::Sim800 {
			// SIM800 answers with just DATA ACCEPT or SEND FAIL
			self.next_at_response(ResponseHandler::Send800, 2);
			"IP"
		} else {
			// SIM7600 answers with both OK and the +CCHSEND event
			self.next_at_response(ResponseHandler::Send7600, 3);
			if slot.is_secure() {
				"CH"
			} else {
				"IP"
			}
		};
		let result = self
			.at_fmt(format_args!(
				"+C{}SEND={},{}",
				family,
				slot.channel.get(),
				len
			))
			.await;
		if slot.is_sending() {
			debug!("sending timed out for socket {}", index);
			slot.sending_finished();
			slot.outgoing.set(0);
		}
		result == AtResult::Ok
	}

	/// Pull the announced inbound bytes from the module.
	pub(crate) async fn receive_packet_impl(&self, index: usize) -> bool {
		let slot = &self.sockets[index];
		slot.incoming_requested();
		self.at_fmt(format_args!(
			"+CCHRECV={},{}",
			slot.channel.get(),
			MAX_PACKET
		))
		.await == AtResult::Ok
	}

	/// Ask the module how much data its channels hold.
	pub(crate) async fn check_incoming_impl(&self, index: usize) -> bool {
		self.sockets[index].incoming_requested();
		self.at("+CCHRECV?").await == AtResult::Ok
	}

	/// Issue the dialect's close command.
	pub(crate) async fn close_impl(&self, index: usize) -> bool {
		let slot = &self.sockets[index];
		let model = self.st.borrow().vendor.model;
		let channel = slot.channel.get();
		match model {
			Model::Sim800 => {
				// completed by "CLOSE OK" instead of a terminal OK
				self.at_fmt(format_args!("+CIPCLOSE={}", channel)).await == AtResult::Ok
			}
			Model::Sim7600 => {
				if slot.is_secure() {
					self.at_fmt(format_args!("+CCHCLOSE={}", channel)).await == AtResult::Ok
				} else {
					self.at_fmt(format_args!("+CIPCLOSE={}", channel)).await == AtResult::Ok
				}
			}
			Model::Unknown => {
				debug!("unsupported modem");
				false
			}
		}
	}

	//--------------------------------------------------------------------------
	// Lifecycle hooks
	//--------------------------------------------------------------------------

	/// Power the module up through the hardware collaborator and restart
	/// the serial pipes.
	pub(crate) async fn power_on_impl(&self, hardware: &mut impl ModemHardware) -> bool {
		if !hardware.power_on().await {
			debug!("power on failed");
			return false;
		}
		debug!("powered on");
		Timer::after(Duration::from_millis(50)).await;
		self.serial_rx.reset();
		self.serial_tx.reset();
		true
	}

	/// Soft power-down, then remove power.
	pub(crate) async fn power_off_impl(&self, hardware: &mut impl ModemHardware) {
		let model = self.st.borrow().vendor.model;
		if model == Model::Sim800 {
			if !self.at_lock().await {
				self.next_at_response(ResponseHandler::PowerDown, 2);
				self.at("+CPOWD=1").await;
			}
		} else {
			self.at("+CPOF").await;
		}
		self.serial_tx.close();
		debug!("powering off");
		hardware.power_off().await;
		// nothing more can arrive; let the RX task drain out
		self.serial_rx.close();
		Timer::after(Duration::from_millis(100)).await;
	}

	/// Negotiate the baud rate and initialise the module.
	pub(crate) async fn start_impl(&self, hardware: &mut impl ModemHardware) -> bool {
		debug!("autobauding");
		hardware.set_baud_rate(115_200);
		hardware.set_flow_control(false);
		hardware.set_parity(Parity::Off);
		for _ in 0..10 {
			// a timed-out probe poisons the channel; the lifecycle restart
			// lifts that so every probe gets a real try
			if self.st.borrow().modem_status == ModemStatus::CommandError {
				self.set_modem_status(ModemStatus::Ok);
			}
			if self.at_lock().await {
				continue;
			}
			self.next_at_timeout(Duration::from_millis(100));
			if self.at("").await == AtResult::Ok {
				return self.initialize(hardware).await;
			}
		}
		debug!("autobauding failed");
		self.set_modem_status(ModemStatus::AutoBaudFailure);
		false
	}

	/// Detect the model and program the line and notification settings.
	async fn initialize(&self, hardware: &mut impl ModemHardware) -> bool {
		self.st.borrow_mut().vendor.reset();

		// turn off command echo
		if self.at("E0").await != AtResult::Ok {
			return false;
		}

		// request modem identification
		if self.at_lock().await {
			return false;
		}
		self.next_at_response(ResponseHandler::Identification, 1);
		if self.at("I").await != AtResult::Ok {
			return false;
		}
		let model = self.st.borrow().vendor.model;
		if model == Model::Unknown {
			debug!("failed to determine model");
			return false;
		}
		debug!("{} detected", model.name());

		if self.options.use_flow_control() {
			debug!("enabling handshaking");
			if self.at("+IFC=2,2").await == AtResult::Ok {
				hardware.set_flow_control(true);
			}
		}

		let parity = self.options.use_parity();
		if parity == Parity::Even || parity == Parity::Odd {
			debug!(
				"enabling {} parity",
				if parity == Parity::Even { "EVEN" } else { "ODD" }
			);
			if self
				.at_fmt(format_args!("+ICF=2,{}", (parity == Parity::Even) as u8))
				.await == AtResult::Ok
			{
				// must wait, communicating too quickly confuses the module
				Timer::after(Duration::from_millis(100)).await;
				hardware.set_parity(parity);
			}
		}

		debug!("switching to {} baud", model.baud_rate());
		if self.at_fmt(format_args!("+IPR={}", model.baud_rate())).await == AtResult::Ok {
			// must wait, communicating too quickly confuses the module
			Timer::after(Duration::from_millis(100)).await;
			hardware.set_baud_rate(model.baud_rate());
		}

		if model == Model::Sim800 {
			// additional identification
			if self.at_lock().await {
				return false;
			}
			self.next_at_response(ResponseHandler::Identification, 1);
			if self.at("+GSV").await != AtResult::Ok {
				return false;
			}
		}

		// extended error reporting
		if self.at("+CMEE=2").await != AtResult::Ok {
			return false;
		}
		// SIM card detection off
		if model == Model::Sim800 && self.at("+CSDT=0").await != AtResult::Ok {
			return false;
		}
		// extended registration notifications, both domains
		if self.at("+CREG=2").await != AtResult::Ok {
			return false;
		}
		if self.at("+CGREG=2").await != AtResult::Ok {
			return false;
		}
		// network timestamp notifications
		if model == Model::Sim800 && self.at("+CLTS=1").await != AtResult::Ok {
			return false;
		}
		if model == Model::Sim7600 && self.at("+CTZR=1").await != AtResult::Ok {
			return false;
		}
		// signal strength and error rate
		if model == Model::Sim800 && self.at("+EXUNSOL=\"SQ\",1").await != AtResult::Ok {
			return false;
		}
		if model == Model::Sim7600 && self.at("+AUTOCSQ=1,1").await != AtResult::Ok {
			return false;
		}
		// network info
		if model == Model::Sim800 && self.at("+CR=1").await != AtResult::Ok {
			return false;
		}
		if model == Model::Sim7600 && self.at("+CPSI=10").await != AtResult::Ok {
			return false;
		}

		if model == Model::Sim800 {
			// wait for CFUN to be nonzero to avoid unnecessary SIM errors
			let _ = with_opt_timeout(
				Duration::from_secs(5),
				self.state_notify
					.until(|| (self.st.borrow().vendor.cfun != 0).then_some(())),
			)
			.await;
		}

		true
	}

	/// The PIN dance: query, present, optionally remove, and classify the
	/// outcome.
	pub(crate) async fn unlock_sim_impl(&self) -> bool {
		let mut attempt = 0;
		while self.at("+CPIN?").await != AtResult::Ok {
			{
				let st = self.st.borrow();
				if st.line_matches("+CME ERROR: ", 0) && st.line_matches("SIM not inserted", 12)
				{
					drop(st);
					self.set_sim_status(SimStatus::NotInserted);
					return false;
				}
			}
			attempt += 1;
			if attempt == 10 {
				return false;
			}
			// try again in a while
			Timer::after(Duration::from_secs(1)).await;
		}

		let mut pin: heapless::String<8> = heapless::String::new();
		if !self.st.borrow().vendor.pin_forgotten {
			let _ = pin.push_str(self.options.pin());
		}

		if self.st.borrow().vendor.sim.pin_required && !pin.is_empty() {
			let used = self.at_fmt(format_args!("+CPIN=\"{}\"", pin)).await == AtResult::Ok;
			self.st.borrow_mut().vendor.sim.pin_used = used;
			if used {
				self.options.on_pin_used();
			}
		}

		let _ = with_opt_timeout(
			Duration::from_secs(5),
			self.state_notify
				.until(|| self.st.borrow().vendor.sim.ready.then_some(())),
		)
		.await;

		let sim = self.st.borrow().vendor.sim;
		if sim.pin_used {
			let remove = self.options.remove_pin();
			if remove {
				// remove the PIN lock from the card
				self.at_fmt(format_args!("+CLCK=\"SC\",0,\"{}\"", pin)).await;
			}
			if !sim.ready || remove {
				// forget the PIN once removed, or after an unsuccessful
				// use, to avoid locking the SIM
				self.st.borrow_mut().vendor.pin_forgotten = true;
			}
		}

		if sim.ready {
			return true;
		}
		if sim.pin_required {
			self.set_sim_status(if sim.pin_used {
				SimStatus::BadPin
			} else {
				SimStatus::Locked
			});
		} else {
			self.set_sim_status(SimStatus::NotInserted);
		}
		false
	}

	/// Wait for registration, then bring up the packet service.
	pub(crate) async fn connect_network_impl(&self) -> bool {
		if self.at("+CREG?").await != AtResult::Ok
			|| self.at("+CGREG?").await != AtResult::Ok
			|| self.at("+COPS?").await != AtResult::Ok
			|| self.at("+CSQ").await != AtResult::Ok
		{
			return false;
		}

		debug!("waiting for network");
		if with_opt_timeout(
			Duration::from_secs(120),
			self.state_notify
				.until(|| self.st.borrow().vendor.net.reg.active.then_some(())),
		)
		.await
		.is_none()
		{
			debug!("no network: {:?}", self.st.borrow().vendor.net.reg);
			self.set_gsm_status(crate::modem::GsmStatus::NoNetwork);
			return false;
		}

		debug!("waiting for GPRS");
		if !self.start_gprs().await {
			self.set_tcp_status(TcpStatus::GprsError);
			return false;
		}
		true
	}

	/// Attach GPRS, define and activate the PDP context, and open the
	/// dialect's transport layers.
	async fn start_gprs(&self) -> bool {
		let gprs_active = || {
			self.state_notify
				.until(|| self.st.borrow().vendor.gprs.reg.active.then_some(()))
		};
		if with_opt_timeout(Duration::from_secs(5), gprs_active())
			.await
			.is_none()
		{
			// attach explicitly when voice registered but packet did not follow
			debug!("attaching GPRS");
			if self.at("+CGATT=1").await != AtResult::Ok {
				return false;
			}
			if with_opt_timeout(Duration::from_secs(5), gprs_active())
				.await
				.is_none()
			{
				return false;
			}
		}
		self.st.borrow_mut().vendor.gprs.attached = true;

		let model = self.st.borrow().vendor.model;
		debug!("connecting GPRS");
		if model == Model::Sim800 {
			// enable socket multiplexing and quick-send mode
			if self.at("+CIPMUX=1").await != AtResult::Ok
				|| self.at("+CIPQSEND=1").await != AtResult::Ok
			{
				return false;
			}
		}

		debug!("connecting to APN: {}", self.options.apn());
		if self
			.at_fmt(format_args!("+CGDCONT=1,\"IP\",\"{}\"", self.options.apn()))
			.await != AtResult::Ok
		{
			return false;
		}

		// activate PDP context
		if self.at_lock().await {
			return false;
		}
		self.next_at_timeout(Duration::from_secs(60));
		if self.at("+CGACT=1,1").await != AtResult::Ok {
			return false;
		}
		self.st.borrow_mut().vendor.gprs.pdp_active = true;

		if model == Model::Sim800 {
			// start the data transfer task
			if self
				.at_fmt(format_args!(
					"+CSTT=\"{}\",\"{}\",\"{}\"",
					self.options.apn(),
					self.options.apn_user(),
					self.options.apn_password()
				))
				.await != AtResult::Ok
			{
				return false;
			}
			// activate GPRS
			if self.at_lock().await {
				return false;
			}
			self.next_at_timeout(Duration::from_secs(60));
			if self.at("+CIICR").await != AtResult::Ok {
				return false;
			}
			// the local IP arrives as a bare line with no terminal OK
			if self.at_lock().await {
				return false;
			}
			self.next_at_response(ResponseHandler::PlainIp, 2);
			if self.at("+CIFSR").await != AtResult::Ok {
				return false;
			}
		} else {
			// configure GPRS auth
			if !self.options.apn_user().is_empty() || !self.options.apn_password().is_empty() {
				if self
					.at_fmt(format_args!(
						"+CGAUTH=1,3,\"{}\",\"{}\"",
						self.options.apn_user(),
						self.options.apn_password()
					))
					.await != AtResult::Ok
				{
					return false;
				}
			}
			// activate TCP and TLS
			if self.at_lock().await {
				return false;
			}
			self.next_at_timeout(Duration::from_secs(60));
			self.next_at_response(ResponseHandler::NetCch, 3);
			if self.at("+NETOPEN").await != AtResult::Ok || self.st.borrow().vendor.net.error {
				return false;
			}
			if self.at("+CCHSET=1,0").await != AtResult::Ok {
				return false;
			}
			if self.at_lock().await {
				return false;
			}
			self.next_at_response(ResponseHandler::NetCch, 3);
			if self.at("+CCHSTART").await != AtResult::Ok || self.st.borrow().vendor.net.error {
				return false;
			}
			// get local IP
			if self.at("+IPADDR").await != AtResult::Ok {
				return false;
			}
		}

		true
	}

	/// Deactivate the PDP context and detach.
	pub(crate) async fn disconnect_network_impl(&self) {
		let model = self.st.borrow().vendor.model;
		if self.st.borrow().vendor.gprs.pdp_active {
			self.st.borrow_mut().vendor.gprs.pdp_active = false;
			if model == Model::Sim800 {
				if !self.at_lock().await {
					self.next_at_response(ResponseHandler::ShutOk, 2);
					self.at("+CIPSHUT").await;
				}
				self.at("+CGACT=0,1").await;
			} else {
				if !self.at_lock().await {
					self.next_at_response(ResponseHandler::NetCch, 3);
					self.at("+CCHSTOP").await;
				}
				if !self.at_lock().await {
					self.next_at_response(ResponseHandler::NetCch, 3);
					self.at("+NETCLOSE").await;
				}
			}
		}
		if self.st.borrow().vendor.gprs.attached {
			self.st.borrow_mut().vendor.gprs.attached = false;
			self.at("+CGATT=0").await;
		}
	}

	/// Nothing to unwind beyond the power-off path on these modules.
	pub(crate) async fn stop_impl(&self) {}

	/// Send one queued SMS in text mode.
	pub(crate) async fn send_message_impl(&self, index: usize) -> bool {
		if self.at("+CMGF=1").await != AtResult::Ok {
			return false;
		}
		if self.at_lock().await {
			return false;
		}
		let slot = &self.messages[index];
		slot.sending();
		self.next_at_transmit_message(index);
		self.next_at_response(ResponseHandler::MessageRef { message: index }, 3);
		let recipient = slot.recipient.borrow().clone();
		let result = self
			.at_fmt(format_args!("+CMGS=\"{}\"", recipient))
			.await;
		if slot.is_sending() {
			debug!("sending timed out for message {}", index);
			return false;
		}
		result == AtResult::Ok
	}

	/// The SIM800 `+SAPBR`/`+CLBS` dance; fills the raw location buffer.
	pub(crate) async fn get_location_impl(&self) -> bool {
		if self.st.borrow().vendor.model == Model::Sim7600 {
			debug!("location is not supported on SIM7600 yet");
			return false;
		}
		if self.at("+CGATT=1").await != AtResult::Ok {
			debug!("location failed: GPRS attach");
			return false;
		}
		if self.at("+SAPBR=3,1,\"Contype\",\"GPRS\"").await != AtResult::Ok {
			debug!("location failed: bearer profile type");
			return false;
		}
		if self
			.at_fmt(format_args!("+SAPBR=3,1,\"APN\",\"{}\"", self.options.apn()))
			.await != AtResult::Ok
		{
			debug!("location failed: bearer profile APN");
			return false;
		}
		if self.at("+SAPBR=1,1").await != AtResult::Ok {
			debug!("location failed: open bearer profile");
			return false;
		}
		if self.at_lock().await {
			return false;
		}
		self.next_at_response(ResponseHandler::Location, 1);
		if self.at("+CLBS=1,1").await != AtResult::Ok {
			debug!("location failed: query");
			return false;
		}
		// the command exchange above released the lock, so there is
		// nothing further to serialise against here
		true
	}

	//--------------------------------------------------------------------------
	// Event dispatch
	//--------------------------------------------------------------------------

	/// Handle one unsolicited event (or in-band response) line. Returns
	/// whether the event was recognised.
	pub(crate) fn on_event(&self, hash: u32) -> bool {
		match hash {
			EV_CSQ | EV_CSQN => {
				let parsed = {
					let mut st = self.st.borrow_mut();
					(st.field_num(), st.field_num())
				};
				if let (Some(raw), Some(ber)) = parsed {
					let rssi = if raw <= 31 {
						-113 + raw * 2
					} else if (100..=191).contains(&raw) {
						-116 + raw
					} else {
						0
					};
					let bucket = if (0..=7).contains(&ber) { ber + 1 } else { 0 };
					{
						let mut st = self.st.borrow_mut();
						st.vendor.net.rssi = rssi as i8;
						st.vendor.net.ber = bucket as i8;
					}
					self.set_rssi(rssi as i8);
					debug!("RSSI: {}, BER bucket: {}", rssi, bucket);
				}
				true
			}

			EV_CREG | EV_CGREG => {
				self.handle_registration(hash == EV_CGREG);
				true
			}

			EV_CPIN => {
				let mut st = self.st.borrow_mut();
				if st.field_matches("READY", 0) {
					st.vendor.sim.ready = true;
				} else if st.field_matches("SIM PIN", 0) {
					st.vendor.sim.pin_required = true;
				}
				true
			}

			EV_CFUN => {
				let mut st = self.st.borrow_mut();
				if let Some(value) = st.field_num() {
					st.vendor.cfun = value as u8;
				}
				true
			}

			EV_CCHOPEN => {
				let (ch, status) = {
					let mut st = self.st.borrow_mut();
					(st.field_num(), st.field_num())
				};
				if let (Some(ch), Some(status)) = (ch, status) {
					match self.find_socket(ch as u8, Some(true)) {
						None => debug!("status arrived for unallocated TLS socket {}", ch),
						Some(index) => {
							if status == 0 {
								debug!("socket {} connected", index);
								self.sockets[index].connected();
							} else {
								debug!("socket {} connection failed: {}", index, status);
								self.sockets[index].disconnected();
							}
							self.request_processing();
						}
					}
				}
				true
			}

			EV_CONNECT_OK => {
				let ch = self.st.borrow().line_peek(0).wrapping_sub(b'0');
				match self.find_socket(ch, None) {
					None => debug!("status arrived for unallocated TCP socket {}", ch),
					Some(index) => {
						debug!("socket {} connected", index);
						self.sockets[index].connected();
						self.request_processing();
					}
				}
				true
			}

			EV_CCHCLOSE | EV_CCH_PEER_CLOSED => {
				let ch = {
					let mut st = self.st.borrow_mut();
					match st.field_num() {
						Some(ch) if hash == EV_CCH_PEER_CLOSED => Some(ch),
						Some(ch) => st.field_num().map(|_status| ch),
						None => None,
					}
				};
				if let Some(ch) = ch {
					match self.find_socket(ch as u8, Some(true)) {
						None => debug!("status arrived for unallocated TLS socket {}", ch),
						Some(index) => {
							debug!("socket {} disconnected", index);
							self.sockets[index].disconnected();
							self.request_processing();
						}
					}
				}
				true
			}

			EV_CLOSE_OK => {
				// this event arrives instead of OK
				self.at_complete(1);
				self.handle_remote_close();
				true
			}

			EV_CLOSED => {
				self.handle_remote_close();
				true
			}

			EV_CCHRECV => {
				self.handle_cchrecv();
				true
			}

			EV_RECEIVE => {
				let (ch, len) = {
					let mut st = self.st.borrow_mut();
					// the length is followed by a colon, so the clean
					// parse fails while the value is still good
					(st.field_num(), st.field_num_lenient())
				};
				if let (Some(ch), Some(len)) = (ch, len) {
					if len > 0 {
						let found = self.find_socket(ch as u8, None);
						match found {
							None => debug!(
								"incoming {} bytes for unallocated TCP socket {}",
								len, ch
							),
							Some(index) => {
								trace!("incoming {} bytes for socket {}", len, index);
								self.sockets[index].maybe_incoming();
							}
						}
						self.request_processing();
						self.receive_for_socket(found, len as usize);
					}
				}
				true
			}

			EV_CCHEVENT => {
				let (ch, kind) = {
					let mut st = self.st.borrow_mut();
					(st.field_num(), st.field_fnv())
				};
				if let Some(ch) = ch {
					if kind == EV_RECV_EVENT {
						// buffered data arrived for the channel
						match self.find_socket(ch as u8, Some(true)) {
							None => {
								debug!("indicated data for unallocated TLS socket {}", ch)
							}
							Some(index) => {
								trace!("indicated data for socket {}", index);
								self.sockets[index].incoming();
								self.request_processing();
							}
						}
					}
				}
				true
			}

			EV_CPSI => {
				self.handle_cpsi();
				true
			}

			EV_CIEV => {
				// TODO: parse the SIM800 indicator events into NetworkInfo
				true
			}

			EV_CTZV | EV_COPS | EV_IPADDR | EV_PDP | EV_RDY | EV_CALL_READY | EV_SMS_READY
			| EV_PSUTTZ | EV_DST => {
				// events we deliberately ignore
				true
			}

			_ => false,
		}
	}

	/// Run the armed one-shot response delegate.
	pub(crate) fn run_response(&self, handler: ResponseHandler, hash: u32) {
		match handler {
			ResponseHandler::Identification => {
				let mut st = self.st.borrow_mut();
				if st.line_matches("SIM800", 0) {
					st.vendor.model = Model::Sim800;
				} else if hash == EV_MODEL
					&& st.field_matches("SIMCOM_", 0)
					&& st.field_matches("SIM7600", 7)
				{
					st.vendor.model = Model::Sim7600;
				}
			}

			ResponseHandler::PlainIp => {
				// just a bare IP address arrives
				self.at_complete(2);
			}

			ResponseHandler::NetCch => {
				if hash == EV_NETOPEN
					|| hash == EV_NETCLOSE
					|| hash == EV_CCHSTART
					|| hash == EV_CCHSTOP
				{
					let mut st = self.st.borrow_mut();
					let code = st.field_num();
					st.vendor.net.error = code != Some(0);
					drop(st);
					self.at_complete(2);
				}
			}

			ResponseHandler::ShutOk => {
				if hash == EV_SHUT_OK {
					self.at_complete(2);
				}
			}

			ResponseHandler::PowerDown => {
				if hash == EV_NORMAL_POWER_DOWN {
					self.at_complete(2);
				}
			}

			ResponseHandler::Send800 => self.handle_send_response_800(hash),

			ResponseHandler::Send7600 => self.handle_send_response_7600(hash),

			ResponseHandler::SendAck { socket } => {
				if hash == EV_CIPACK {
					let (sent, ack, nak) = {
						let mut st = self.st.borrow_mut();
						(st.field_num(), st.field_num(), st.field_num())
					};
					if let (Some(sent), Some(_ack), Some(_nak)) = (sent, ack, nak) {
						let slot = &self.sockets[socket];
						let current = slot.tx.reader().position().offset() as i64;
						let delta = i64::from(sent) - current;
						if delta < 0 {
							// the module claims fewer bytes than we ever
							// handed it; the stream cannot be trusted
							warn!(
								"socket {} ack position went backwards ({} < {})",
								socket, sent, current
							);
							slot.finished();
						} else if delta > 0 {
							debug!(
								"recovering after error, advancing {} to {}",
								delta, sent
							);
							slot.tx.reader().advance(delta as usize);
						}
						slot.error.set(false);
						self.at_complete(2);
					}
				}
			}

			ResponseHandler::MessageRef { message } => {
				if hash == EV_CMGS {
					self.at_complete(2);
					let reference = self.st.borrow_mut().field_num().unwrap_or(0);
					self.messages[message].sending_complete(reference);
				}
			}

			ResponseHandler::Location => {
				let text = self.st.borrow().field_rest();
				self.st.borrow_mut().location_text = text;
				self.at_complete(2);
			}
		}
	}

	/// `+CREG`/`+CGREG`, both the unsolicited and the query-response
	/// shapes (the latter carry a leading mode field).
	fn handle_registration(&self, is_gprs: bool) {
		let disconnecting = self.signals.any(signal::NETWORK_DISCONNECTING);
		let mut st = self.st.borrow_mut();
		if matches!(st.field_count(), 2 | 4) {
			// response to a query, skip the mode field
			st.field_num();
		}
		let Some(status) = st.field_num() else {
			return;
		};
		let status = Registration::from(status);
		let active = matches!(status, Registration::Home | Registration::Roaming);
		{
			let reg = if is_gprs {
				&mut st.vendor.gprs.reg
			} else {
				&mut st.vendor.net.reg
			};
			reg.status = status;
			reg.active = active;
		}
		if !disconnecting {
			// do not report status flapping caused by our own teardown
			st.gsm_status = match status {
				Registration::Home => crate::modem::GsmStatus::Ok,
				Registration::Roaming => crate::modem::GsmStatus::Roaming,
				_ => crate::modem::GsmStatus::Searching,
			};
		}
		let lac = st.field_hex();
		let ci = st.field_hex();
		let domain = if is_gprs { "GPRS" } else { "GSM" };
		if let (Some(lac), Some(ci)) = (lac, ci) {
			let reg = if is_gprs {
				&mut st.vendor.gprs.reg
			} else {
				&mut st.vendor.net.reg
			};
			reg.lac = lac as u16;
			reg.ci = ci as u16;
			debug!(
				"{}: {:?}, LAC: {:04X}, CI: {:04X}",
				domain, status, lac, ci
			);
		} else {
			debug!("{}: {:?}", domain, status);
		}
	}

	/// `CLOSED` / the channel part of `CLOSE OK`: the channel digit is
	/// the first character of the raw line.
	fn handle_remote_close(&self) {
		let ch = self.st.borrow().line_peek(0).wrapping_sub(b'0');
		match self.find_socket(ch, None) {
			None => debug!("status arrived for unallocated TCP socket {}", ch),
			Some(index) => {
				debug!("socket {} disconnected", index);
				self.sockets[index].disconnected();
				self.request_processing();
			}
		}
	}

	/// The three shapes of `+CCHRECV:`: a two-field end-of-receive, a
	/// `DATA` header announcing a binary segment, and a `LEN` report of
	/// per-channel buffered byte counts.
	fn handle_cchrecv(&self) {
		let end_of_receive = {
			let mut st = self.st.borrow_mut();
			if st.field_count() == 2 {
				let saved = st.line.fields;
				match (st.field_num(), st.field_num()) {
					(Some(ch), Some(err)) => Some((ch, err)),
					_ => {
						st.line.fields = saved;
						None
					}
				}
			} else {
				None
			}
		};
		if let Some((ch, err)) = end_of_receive {
			match self.find_socket(ch as u8, Some(true)) {
				None => debug!("end of receive for unallocated TLS socket {}", ch),
				Some(index) => {
					if err != 0 {
						debug!("socket {} disconnected", index);
						self.sockets[index].disconnected();
					} else {
						// look for more data
						self.sockets[index].maybe_incoming();
					}
					self.request_processing();
				}
			}
			return;
		}
		let kind = self.st.borrow_mut().field_fnv();
		match kind {
			EV_DATA => {
				let (ch, len) = {
					let mut st = self.st.borrow_mut();
					(st.field_num(), st.field_num())
				};
				if let (Some(ch), Some(len)) = (ch, len) {
					// data received for the channel
					let found = self.find_socket(ch as u8, Some(true));
					match found {
						None => debug!(
							"incoming {} bytes for unallocated TLS socket {}",
							len, ch
						),
						Some(index) => {
							trace!("incoming {} bytes for socket {}", len, index);
							self.sockets[index].maybe_incoming();
						}
					}
					self.request_processing();
					self.receive_for_socket(found, len.max(0) as usize);
				}
			}
			EV_LEN => {
				let mut channel = 0u8;
				loop {
					let len = self.st.borrow_mut().field_num();
					let Some(len) = len else { break };
					if len > 0 {
						match self.find_socket(channel, Some(true)) {
							None => debug!(
								"unallocated TLS socket {} has {} bytes buffered",
								channel, len
							),
							Some(index) => {
								trace!("{} bytes buffered for socket {}", len, index);
								self.sockets[index].incoming();
								self.request_processing();
							}
						}
					}
					channel += 1;
				}
			}
			_ => {}
		}
	}

	/// `+CPSI:` carries `MCC-MNC` in its third field.
	fn handle_cpsi(&self) {
		let mut st = self.st.borrow_mut();
		st.field_fnv(); // network type
		st.field_fnv(); // operation mode
		let rest = st.field_rest();
		let mut mcc = (0u32, 0u8);
		let mut mnc = (0u32, 0u8);
		let mut in_mnc = false;
		for &c in rest.as_bytes() {
			let current = if in_mnc { &mut mnc } else { &mut mcc };
			match c {
				b'0'..=b'9' => {
					current.0 = current.0 * 10 + u32::from(c - b'0');
					current.1 += 1;
				}
				b'-' if !in_mnc => in_mnc = true,
				_ => break,
			}
		}
		if mcc.1 == 0 || !(mnc.1 == 2 || mnc.1 == 3) {
			trace!("invalid MCC/MNC value");
		}
		let info = NetworkInfo::new(mcc.0 as u16, mnc.0 as u16, mnc.1);
		drop(st);
		self.set_network_info(info);
	}

	/// SIM800 send completion: `DATA ACCEPT` acknowledges, `SEND FAIL`
	/// flags the socket for `+CIPACK` recovery. Both arrive instead of a
	/// terminal OK.
	fn handle_send_response_800(&self, hash: u32) {
		if hash == EV_DATA_ACCEPT {
			let (ch, len) = {
				let mut st = self.st.borrow_mut();
				(st.field_num(), st.field_num())
			};
			if let (Some(ch), Some(len)) = (ch, len) {
				match self.find_socket(ch as u8, None) {
					None => debug!(
						"send confirmation ({}) for unallocated TCP socket {}",
						len, ch
					),
					Some(index) => {
						let slot = &self.sockets[index];
						trace!("{} bytes accepted for socket {}", len, index);
						debug_assert_eq!(len.max(0) as usize, slot.outgoing.get());
						slot.sending_finished();
						slot.tx.reader().advance(len.max(0) as usize);
						slot.outgoing.set(0);
					}
				}
			}
			self.at_complete(2);
		} else if hash == EV_SEND_FAIL {
			let ch = self.st.borrow().line_peek(0).wrapping_sub(b'0');
			match self.find_socket(ch, None) {
				None => debug!("send failure for unallocated TCP socket {}", ch),
				Some(index) => {
					let slot = &self.sockets[index];
					debug!(
						"sending failed for socket {} ({} bytes)",
						index,
						slot.last_sent.get()
					);
					slot.sending_finished();
					slot.outgoing.set(0);
					slot.error.set(true);
				}
			}
			self.at_complete(2);
		}
	}

	/// SIM7600 send completion: `+CCHSEND: ch,err` paired with OK.
	fn handle_send_response_7600(&self, hash: u32) {
		if hash == EV_CCHSEND {
			let (ch, err) = {
				let mut st = self.st.borrow_mut();
				(st.field_num(), st.field_num())
			};
			if let (Some(ch), Some(err)) = (ch, err) {
				match self.find_socket(ch as u8, Some(true)) {
					None => debug!(
						"send confirmation ({}) for unallocated TLS socket {}",
						err, ch
					),
					Some(index) => {
						let slot = &self.sockets[index];
						if err != 0 {
							debug!("sending failed ({}) for socket {}", err, index);
						} else {
							trace!("packet sent for socket {}", index);
							slot.tx.reader().advance(slot.outgoing.get());
						}
						slot.outgoing.set(0);
						slot.sending_finished();
					}
				}
			}
			self.at_complete(2);
		}
	}
}

//******************************************************************************
// Tests
//******************************************************************************

#[cfg(test)]
mod test {
	use super::*;
	use crate::modem::{AtResult, GsmStatus, Modem};
	use crate::test_util::{drive, poll_once, Script, Step, TestHardware, TestOptions};
	use core::pin::pin;
	use core::task::Poll;
	use embassy_futures::select::{select, Either};

	/// Poll a fresh RX task future a few times to digest buffered input.
	fn poll_rx(modem: &Modem<'_>, times: usize) {
		let mut rx = pin!(modem.rx_task());
		for _ in 0..times {
			let _ = poll_once(rx.as_mut());
		}
	}

	/// Run one operation future beside the RX task against a script. The
	/// budget leaves room for the unlock path's five-second ready wait.
	fn run_op<F: core::future::Future>(
		modem: &Modem<'_>,
		script: &mut Script,
		op: F,
	) -> F::Output {
		let mut fut = pin!(select(op, modem.rx_task()));
		for _ in 0..20000 {
			match poll_once(fut.as_mut()) {
				Poll::Ready(Either::First(result)) => return result,
				Poll::Ready(Either::Second(())) => panic!("rx task stopped"),
				Poll::Pending => {}
			}
			script.pump(modem);
			std::thread::sleep(std::time::Duration::from_millis(1));
		}
		panic!("operation stalled at script step");
	}

	fn pending_command(modem: &Modem<'_>) {
		let mut st = modem.st.borrow_mut();
		st.at.result = AtResult::Pending;
		st.at.require = 1;
		st.at.complete = 0;
		drop(st);
		modem.signals.set(signal::TASK_ACTIVE | signal::AT_LOCK);
	}

	#[test]
	fn whitelisted_event_then_ok_completes_command() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim7600;
		pending_command(&modem);
		modem.link_input().try_write(b"RDY\r\nOK\r\n");
		poll_rx(&modem, 3);
		assert_eq!(modem.st.borrow().at.result, AtResult::Ok);
	}

	#[test]
	fn registration_event_updates_network_state() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim7600;
		modem.link_input().try_write(b"+CREG: 2,1,\"ABCD\",\"1234\"\r\n");
		poll_rx(&modem, 3);
		assert_eq!(modem.gsm_status(), GsmStatus::Ok);
		let st = modem.st.borrow();
		assert!(st.vendor.net.reg.active);
		assert_eq!(st.vendor.net.reg.lac, 0xABCD);
		assert_eq!(st.vendor.net.reg.ci, 0x1234);
	}

	#[test]
	fn signal_quality_event_updates_rssi() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.link_input().try_write(b"+CSQ: 15,3\r\n");
		poll_rx(&modem, 3);
		assert_eq!(modem.rssi(), -83);
		assert_eq!(modem.st.borrow().vendor.net.ber, 4);
	}

	#[test]
	fn receive_segment_and_remote_close() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim7600;
		let socket = modem.create_socket("example.com", 443, true).unwrap();
		let slot = &modem.sockets[0];
		slot.channel.set(0);
		slot.allocate();
		slot.bound();
		slot.connected();

		modem.link_input().try_write(b"+CCHRECV: DATA,0,5\r\nhello");
		poll_rx(&modem, 3);
		let mut buf = [0u8; 16];
		assert_eq!(socket.input().try_read(&mut buf), 5);
		assert_eq!(&buf[..5], b"hello");
		assert!(socket.is_connected());

		modem.link_input().try_write(b"0, CLOSED\r\n");
		poll_rx(&modem, 3);
		assert!(!socket.is_connected());
		assert!(socket.is_closed());
		assert!(slot.tx.is_closed());
	}

	#[test]
	fn buffered_length_report_flags_incoming() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim7600;
		let _socket = modem.create_socket("example.com", 443, true).unwrap();
		let slot = &modem.sockets[0];
		slot.channel.set(0);
		slot.allocate();
		slot.bound();
		slot.connected();

		modem.link_input().try_write(b"+CCHRECV: LEN,7,0\r\n");
		poll_rx(&modem, 3);
		assert!(slot.data_to_receive());
	}

	#[test]
	fn send_acknowledge_and_cipack_recovery() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim800;
		let socket = modem.create_socket("example.com", 80, false).unwrap();
		let slot = &modem.sockets[0];
		slot.channel.set(0);
		slot.allocate();
		slot.bound();
		slot.connected();

		// a clean send advances the transmit cursor by the acked count
		assert_eq!(socket.output().try_write(b"hello"), 5);
		let mut script = Script::new(std::vec![
			Step::Cmd("AT+CIPSEND=0,5", ">"),
			Step::Raw(b"hello", "DATA ACCEPT:0,5\r\n"),
		]);
		assert!(run_op(&modem, &mut script, modem.send_packet_impl(0)));
		assert!(script.finished());
		assert_eq!(slot.tx.reader().position().offset(), 5);

		// a failed send leaves the cursor alone and flags the socket
		assert_eq!(socket.output().try_write(b"world"), 5);
		let mut script = Script::new(std::vec![
			Step::Cmd("AT+CIPSEND=0,5", ">"),
			Step::Raw(b"world", "0, SEND FAIL\r\n"),
		]);
		assert!(run_op(&modem, &mut script, modem.send_packet_impl(0)));
		assert!(script.finished());
		assert!(slot.error.get());
		assert_eq!(slot.tx.reader().position().offset(), 5);

		// the retry re-reads the ack state before sending again
		let mut script = Script::new(std::vec![
			Step::Cmd("AT+CIPACK=0", "+CIPACK: 5,5,0\r\nOK\r\n"),
			Step::Cmd("AT+CIPSEND=0,5", ">"),
			Step::Raw(b"world", "DATA ACCEPT:0,5\r\n"),
		]);
		assert!(run_op(&modem, &mut script, modem.send_packet_impl(0)));
		assert!(script.finished());
		assert!(!slot.error.get());
		assert_eq!(slot.tx.reader().position().offset(), 10);
	}

	#[test]
	fn backwards_cipack_count_closes_the_socket() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim800;
		let _socket = modem.create_socket("example.com", 80, false).unwrap();
		let slot = &modem.sockets[0];
		slot.channel.set(0);
		slot.allocate();
		slot.bound();
		slot.connected();
		slot.tx.writer().try_write(b"hello");
		slot.tx.reader().advance(5);
		slot.tx.writer().try_write(b"world");
		slot.error.set(true);

		// the module claims less than we have ever handed it
		let mut script = Script::new(std::vec![Step::Cmd(
			"AT+CIPACK=0",
			"+CIPACK: 2,2,0\r\nOK\r\n"
		)]);
		assert!(!run_op(&modem, &mut script, modem.send_packet_impl(0)));
		assert!(slot.is_closed());
	}

	#[test]
	fn pin_request_without_a_pin_reports_locked() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim800;
		let mut script = Script::new(std::vec![Step::Cmd(
			"AT+CPIN?",
			"+CPIN: SIM PIN\r\nOK\r\n"
		)]);
		assert!(!run_op(&modem, &mut script, modem.unlock_sim_impl()));
		assert!(script.finished());
		assert!(modem.st.borrow().vendor.sim.pin_required);
		assert_eq!(modem.sim_status(), SimStatus::Locked);
	}

	#[test]
	fn rejected_pin_reports_bad_pin_and_forgets_it() {
		let mut options = TestOptions::new();
		options.pin = "1234";
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim800;
		// the card accepts the command but never reports READY
		let mut script = Script::new(std::vec![
			Step::Cmd("AT+CPIN?", "+CPIN: SIM PIN\r\nOK\r\n"),
			Step::Cmd("AT+CPIN=\"1234\"", "OK\r\n"),
		]);
		assert!(!run_op(&modem, &mut script, modem.unlock_sim_impl()));
		assert!(script.finished());
		assert_eq!(modem.sim_status(), SimStatus::BadPin);
		// the PIN must not be retried into a locked card
		assert!(modem.st.borrow().vendor.pin_forgotten);
	}

	#[test]
	fn location_query_captures_fields() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.st.borrow_mut().vendor.model = Model::Sim800;
		let mut script = Script::new(std::vec![
			Step::Cmd("AT+CGATT=1", "OK\r\n"),
			Step::Cmd("AT+SAPBR=3,1,\"Contype\",\"GPRS\"", "OK\r\n"),
			Step::Cmd("AT+SAPBR=3,1,\"APN\",\"internet\"", "OK\r\n"),
			Step::Cmd("AT+SAPBR=1,1", "OK\r\n"),
			Step::Cmd("AT+CLBS=1,1", "+CLBS: 0,51.5074,-0.1278,550\r\nOK\r\n"),
		]);
		assert!(run_op(&modem, &mut script, modem.get_location_impl()));
		assert!(script.finished());
		assert_eq!(modem.location_text().as_str(), "0,51.5074,-0.1278,550");
	}

	#[test]
	fn create_and_release_destroys_without_power_on() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		let (mut hardware, hw_log) = TestHardware::new();
		let socket = modem.create_socket("example.com", 80, false).unwrap();
		socket.release();
		let mut script = Script::new(std::vec![]);
		let mut run = pin!(modem.run(&mut hardware));
		drive(
			&mut run,
			&modem,
			&mut script,
			|| modem.sockets[0].is_free() && !modem.is_active(),
			100,
		);
		// never needed the module for this
		assert!(hw_log.borrow().is_empty());
		let mut idle = pin!(modem.wait_for_idle(embassy_time::Duration::from_millis(0)));
		assert_eq!(poll_once(idle.as_mut()), Poll::Ready(true));
	}

	#[test]
	fn full_lifecycle_sim7600() {
		let options = TestOptions::new();
		let modem = Modem::new(&options);
		modem.set_power_off_timeout(embassy_time::Duration::from_millis(50));
		let (mut hardware, hw_log) = TestHardware::new();

		let socket = modem.create_socket("example.com", 443, true).unwrap();
		let mut script = Script::new(std::vec![
			Step::Cmd("AT", "OK\r\n"),
			Step::Cmd("ATE0", "OK\r\n"),
			Step::Cmd("ATI", "Model: SIMCOM_SIM7600E\r\nOK\r\n"),
			Step::Cmd("AT+IFC=2,2", "OK\r\n"),
			Step::Cmd("AT+ICF=2,1", "OK\r\n"),
			Step::Cmd("AT+IPR=3200000", "OK\r\n"),
			Step::Cmd("AT+CMEE=2", "OK\r\n"),
			Step::Cmd("AT+CREG=2", "OK\r\n"),
			Step::Cmd("AT+CGREG=2", "OK\r\n"),
			Step::Cmd("AT+CTZR=1", "OK\r\n"),
			Step::Cmd("AT+AUTOCSQ=1,1", "OK\r\n"),
			Step::Cmd("AT+CPSI=10", "OK\r\n"),
			Step::Cmd("AT+CPIN?", "+CPIN: READY\r\nOK\r\n"),
			Step::Cmd("AT+CREG?", "+CREG: 2,1,\"ABCD\",\"1234\"\r\nOK\r\n"),
			Step::Cmd("AT+CGREG?", "+CGREG: 2,1,\"ABCD\",\"1234\"\r\nOK\r\n"),
			Step::Cmd("AT+COPS?", "+COPS: 0,0,\"TestNet\",7\r\nOK\r\n"),
			Step::Cmd("AT+CSQ", "+CSQ: 15,3\r\nOK\r\n"),
			Step::Cmd("AT+CGDCONT=1,\"IP\",\"internet\"", "OK\r\n"),
			Step::Cmd("AT+CGACT=1,1", "OK\r\n"),
			Step::Cmd("AT+NETOPEN", "OK\r\n+NETOPEN: 0\r\n"),
			Step::Cmd("AT+CCHSET=1,0", "OK\r\n"),
			Step::Cmd("AT+CCHSTART", "OK\r\n+CCHSTART: 0\r\n"),
			Step::Cmd("AT+IPADDR", "+IPADDR: 10.0.0.1\r\nOK\r\n"),
			Step::Cmd("AT+CCHOPEN=0,\"example.com\",443,2", "OK\r\n+CCHOPEN: 0,0\r\n"),
			Step::Cmd("AT+CCHCLOSE=0", "OK\r\n+CCHCLOSE: 0,0\r\n"),
			Step::Cmd("AT+CMGF=1", "OK\r\n"),
			Step::Cmd("AT+CMGS=\"+100\"", ">"),
			Step::Raw(b"Hi\x1a", "+CMGS: 42\r\nOK\r\n"),
			Step::Cmd("AT+CCHSTOP", "OK\r\n+CCHSTOP: 0\r\n"),
			Step::Cmd("AT+NETCLOSE", "OK\r\n+NETCLOSE: 0\r\n"),
			Step::Cmd("AT+CGATT=0", "OK\r\n"),
			Step::Cmd("AT+CPOF", "OK\r\n"),
		]);

		let mut run = pin!(modem.run(&mut hardware));
		drive(&mut run, &modem, &mut script, || socket.is_connected(), 5000);
		assert_eq!(modem.detected_model(), Model::Sim7600);
		assert_eq!(modem.gsm_status(), GsmStatus::Ok);
		assert_eq!(modem.rssi(), -83);
		assert!(modem.is_active());

		socket.release();
		drive(
			&mut run,
			&modem,
			&mut script,
			|| modem.sockets[0].is_free(),
			5000,
		);

		let message = modem.send_message("+100", "Hi").unwrap();
		drive(
			&mut run,
			&modem,
			&mut script,
			|| message.message_reference() == 42,
			5000,
		);
		{
			let mut wait =
				pin!(message.wait_until_processed(embassy_time::Duration::from_millis(0)));
			assert_eq!(poll_once(wait.as_mut()), Poll::Ready(true));
		}
		assert!(message.sent());
		message.release();

		drive(&mut run, &modem, &mut script, || !modem.is_active(), 5000);
		assert!(script.finished());
		assert!(hw_log.borrow().iter().any(|entry| entry == "power off"));
		assert!(hw_log.borrow().iter().any(|entry| entry == "baud 3200000"));
	}
}

//******************************************************************************
// End of File
//******************************************************************************
