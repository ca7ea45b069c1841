//! # Collaborator contracts for simcomlib
//!
//! The driver core deliberately owns no hardware. Everything it needs from
//! the outside world comes through the two traits here: [`ModemOptions`]
//! for configuration and diagnostics, and [`ModemHardware`] for the power
//! and serial-line choreography that lives behind GPIO pins and the UART
//! peripheral.
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

// None

//******************************************************************************
// Types
//******************************************************************************

/// Serial parity settings the driver may ask the hardware to apply.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parity {
	/// No parity bit.
	Off,
	/// Odd parity.
	Odd,
	/// Even parity.
	Even,
	/// Parity bit always one.
	Mark,
	/// Parity bit always zero.
	Space,
}

/// Classification of bytes handed to the diagnostic sink.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallbackType {
	/// A command as written to the module (without the trailing CR).
	CommandSend,
	/// A response or event line as read from the module.
	CommandReceive,
	/// A command that failed at the AT level.
	CommandError,
	/// A power-state request ("ON"/"OFF").
	PowerSend,
	/// A power-state outcome ("ON"/"ERR"/"FAIL"/"OFF").
	PowerReceive,
}

/// Configuration and notification hooks consumed by the driver.
///
/// Every method has a sensible default, so an implementation only overrides
/// what its application cares about. The driver never stores anything it
/// learns here; hooks are re-queried whenever their value is needed.
pub trait ModemOptions {
	/// Access point name for the data bearer.
	fn apn(&self) -> &str {
		""
	}

	/// User name for APN authentication, empty when unauthenticated.
	fn apn_user(&self) -> &str {
		""
	}

	/// Password for APN authentication, empty when unauthenticated.
	fn apn_password(&self) -> &str {
		""
	}

	/// SIM PIN to present when the card asks for one, empty for none.
	fn pin(&self) -> &str {
		""
	}

	/// Called once the stored PIN has been presented to the card, so the
	/// application can update any persistent retry bookkeeping.
	fn on_pin_used(&self) {}

	/// Whether the driver should remove the PIN lock from the card after a
	/// successful unlock.
	fn remove_pin(&self) -> bool {
		false
	}

	/// Whether to enable RTS/CTS handshaking on the link.
	fn use_flow_control(&self) -> bool {
		true
	}

	/// Parity to run the link with.
	///
	/// Even parity is the default, to catch low spikes on the line which
	/// would otherwise be treated as valid 0xFF bytes.
	fn use_parity(&self) -> Parity {
		Parity::Even
	}

	/// Called when the module has been powered on.
	fn on_power_on(&self) {}

	/// Called when the module has been powered off.
	fn on_power_off(&self) {}

	/// Diagnostic sink for protocol and power traffic.
	///
	/// Called from inside the driver; implementations must only record the
	/// bytes and must not call back into the driver.
	fn diagnostic(&self, kind: CallbackType, data: &[u8]) {
		let _ = (kind, data);
	}
}

/// Power and serial-line control consumed by the driver.
///
/// Implementations own the power-enable, power-button, status and DTR lines
/// and the UART peripheral feeding the driver's serial pipes.
pub trait ModemHardware {
	/// Bring the module up: drive the enable/button lines, wait for the
	/// status line, assert DTR and start the UART. Returns `false` when the
	/// module did not come up.
	async fn power_on(&mut self) -> bool;

	/// Remove power from the module and stop the UART.
	///
	/// Once this returns, no further bytes may be written into the driver's
	/// serial receive pipe.
	async fn power_off(&mut self);

	/// Reprogram the UART baud rate.
	fn set_baud_rate(&mut self, baud: u32);

	/// Enable or disable RTS/CTS handshaking on the UART.
	fn set_flow_control(&mut self, enabled: bool);

	/// Reprogram the UART parity.
	fn set_parity(&mut self, parity: Parity);
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
