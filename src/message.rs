//! # SMS messages for simcomlib
//!
//! Messages follow the socket ownership model in miniature: the application
//! holds a [`Message`] handle, the runtime owns the slot, and the slot is
//! recycled only once the application has released it and the send attempt
//! is over.
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
use crate::wait::FlagCell;

//******************************************************************************
// Types
//******************************************************************************

/// Application handle to one outgoing SMS.
pub struct Message<'a> {
	modem: &'a Modem<'a>,
	index: usize,
}

/// Storage and state for one message, owned by the modem.
pub(crate) struct MessageSlot {
	pub(crate) flags: FlagCell,
	pub(crate) recipient: RefCell<heapless::String<MAX_RECIPIENT>>,
	pub(crate) text: RefCell<heapless::String<MAX_TEXT>>,
	/// Message reference assigned by the module, -1 until then.
	pub(crate) reference: Cell<i32>,
}

//******************************************************************************
// Constants
//******************************************************************************

/// Longest accepted recipient address.
pub(crate) const MAX_RECIPIENT: usize = 20;

/// Longest accepted message text.
pub(crate) const MAX_TEXT: usize = 160;

/// Message flag bits.
pub(crate) mod flag {
	/// The application still holds a handle.
	pub const APP_REFERENCE: u32 = 0x01;
	/// The message is yet to be sent by the modem.
	pub const MODEM_WILL_SEND: u32 = 0x10;
	/// The message is being sent right now.
	pub const MODEM_SENDING: u32 = 0x20;
	/// Sending failed.
	pub const MODEM_SEND_FAILED: u32 = 0x80;
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

impl<'a> Message<'a> {
	pub(crate) fn new(modem: &'a Modem<'a>, index: usize) -> Message<'a> {
		Message { modem, index }
	}

	/// The recipient the message was created with.
	pub fn recipient(&self) -> heapless::String<MAX_RECIPIENT> {
		self.slot().recipient.borrow().clone()
	}

	/// The text the message was created with.
	pub fn text(&self) -> heapless::String<MAX_TEXT> {
		self.slot().text.borrow().clone()
	}

	/// The reference number the module assigned, or -1 when the message has
	/// not been accepted (yet, or at all).
	pub fn message_reference(&self) -> i32 {
		self.slot().reference.get()
	}

	/// Whether the message has been sent successfully.
	pub fn sent(&self) -> bool {
		!self
			.slot()
			.flags
			.any(flag::MODEM_WILL_SEND | flag::MODEM_SEND_FAILED)
	}

	/// Wait until the modem is done with the message, successfully or not.
	///
	/// Returns whether the outcome arrived in time; use [`Message::sent`]
	/// to distinguish success from failure.
	pub async fn wait_until_processed(&self, timeout: Duration) -> bool {
		self.slot()
			.flags
			.wait_timeout(timeout, |f| (f & flag::MODEM_WILL_SEND == 0).then_some(()))
			.await
			.is_some()
	}

	/// Give the message back to the runtime for recycling.
	pub fn release(self) {
		self.modem.release_message(self.index);
	}
}

//******************************************************************************
// Private Functions and Impl on Private Types
//******************************************************************************

impl<'a> Message<'a> {
	fn slot(&self) -> &'a MessageSlot {
		self.modem.message_slot(self.index)
	}
}

impl MessageSlot {
	pub(crate) const fn new() -> MessageSlot {
		MessageSlot {
			flags: FlagCell::new(0),
			recipient: RefCell::new(heapless::String::new()),
			text: RefCell::new(heapless::String::new()),
			reference: Cell::new(-1),
		}
	}

	pub(crate) fn is_free(&self) -> bool {
		self.flags.get() == 0
	}

	pub(crate) fn recycle(&self) {
		self.recipient.borrow_mut().clear();
		self.text.borrow_mut().clear();
		self.reference.set(-1);
		self.flags.replace(0);
	}

	pub(crate) fn should_send(&self) -> bool {
		self.flags.any(flag::MODEM_WILL_SEND)
	}

	pub(crate) fn is_sending(&self) -> bool {
		self.flags.any(flag::MODEM_SENDING)
	}

	pub(crate) fn can_delete(&self) -> bool {
		!self.flags.any(flag::APP_REFERENCE | flag::MODEM_WILL_SEND)
	}

	/// The send command is going out.
	pub(crate) fn sending(&self) {
		self.flags.set(flag::MODEM_SENDING);
	}

	/// The module accepted the message and assigned a reference.
	pub(crate) fn sending_complete(&self, reference: i32) {
		self.reference.set(reference);
		self.flags
			.clear(flag::MODEM_WILL_SEND | flag::MODEM_SENDING);
	}

	/// The send attempt failed for good.
	pub(crate) fn sending_failed(&self) {
		let flags = self.flags.get();
		self.flags.replace(
			(flags & !(flag::MODEM_WILL_SEND | flag::MODEM_SENDING)) | flag::MODEM_SEND_FAILED,
		);
	}
}

//******************************************************************************
// Tests
//******************************************************************************

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn lifecycle_success() {
		let slot = MessageSlot::new();
		slot.flags.replace(flag::APP_REFERENCE | flag::MODEM_WILL_SEND);
		assert!(slot.should_send());
		assert!(!slot.can_delete());
		slot.sending();
		assert!(slot.is_sending());
		slot.sending_complete(42);
		assert_eq!(slot.reference.get(), 42);
		assert!(!slot.should_send());
		assert!(!slot.can_delete());
		slot.flags.clear(flag::APP_REFERENCE);
		assert!(slot.can_delete());
	}

	#[test]
	fn lifecycle_failure() {
		let slot = MessageSlot::new();
		slot.flags.replace(flag::APP_REFERENCE | flag::MODEM_WILL_SEND);
		slot.sending();
		slot.sending_failed();
		assert!(!slot.should_send());
		assert!(slot.flags.any(flag::MODEM_SEND_FAILED));
		assert_eq!(slot.reference.get(), -1);
	}
}

//******************************************************************************
// End of File
//******************************************************************************
