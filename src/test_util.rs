//! # Test support for simcomlib
//!
//! A minimal polling harness for driving the driver's futures on the host,
//! plus scripted stand-ins for the module (expected command / canned reply
//! pairs fed through the serial pipes) and for the collaborator traits.
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
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use crate::modem::Modem;
use crate::options::{CallbackType, ModemHardware, ModemOptions, Parity};

//******************************************************************************
// Types
//******************************************************************************

/// One exchange of a scripted dialogue with the "module".
pub(crate) enum Step {
	/// Expect this CR-terminated command, then feed the reply.
	Cmd(&'static str, &'static str),
	/// Expect exactly these raw bytes (a prompt payload), then reply.
	Raw(&'static [u8], &'static str),
}

/// Plays the module's side of a scripted AT dialogue.
pub(crate) struct Script {
	steps: Vec<Step>,
	pos: usize,
	pending: Vec<u8>,
}

/// Configurable [`ModemOptions`] stub that records diagnostics.
pub(crate) struct TestOptions {
	pub(crate) apn: &'static str,
	pub(crate) pin: &'static str,
	pub(crate) diagnostics: RefCell<Vec<(CallbackType, String)>>,
}

/// [`ModemHardware`] stub that records every call.
pub(crate) struct TestHardware {
	log: Rc<RefCell<Vec<String>>>,
}

//******************************************************************************
// Constants
//******************************************************************************

static VTABLE: RawWakerVTable = RawWakerVTable::new(raw_clone, raw_noop, raw_noop, raw_noop);

fn raw_clone(_: *const ()) -> RawWaker {
	RawWaker::new(core::ptr::null(), &VTABLE)
}

fn raw_noop(_: *const ()) {}

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

/// Poll a future once with a no-op waker.
///
/// The driver re-evaluates its predicates on every poll, so repeatedly
/// calling this makes progress without a real executor.
pub(crate) fn poll_once<F: Future>(fut: Pin<&mut F>) -> Poll<F::Output> {
	let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
	let mut cx = Context::from_waker(&waker);
	F::poll(fut, &mut cx)
}

/// Poll `fut` and pump the script until `done` holds. Panics when the
/// budget runs out, which usually means the script and the driver
/// disagree about the dialogue.
pub(crate) fn drive<F: Future>(
	fut: &mut Pin<&mut F>,
	modem: &Modem<'_>,
	script: &mut Script,
	mut done: impl FnMut() -> bool,
	max_iterations: usize,
) {
	for _ in 0..max_iterations {
		let _ = poll_once(fut.as_mut());
		script.pump(modem);
		if done() {
			return;
		}
		std::thread::sleep(std::time::Duration::from_millis(1));
	}
	panic!("test stalled at script step {}", script.pos);
}

impl Script {
	pub(crate) fn new(steps: Vec<Step>) -> Script {
		Script {
			steps,
			pos: 0,
			pending: Vec::new(),
		}
	}

	/// Play as many script steps as the driver's output allows.
	pub(crate) fn pump(&mut self, modem: &Modem<'_>) {
		let mut buf = [0u8; 256];
		loop {
			let n = modem.link_output().try_read(&mut buf);
			if n == 0 {
				break;
			}
			self.pending.extend_from_slice(&buf[..n]);
		}
		while self.pos < self.steps.len() {
			match &self.steps[self.pos] {
				Step::Cmd(expect, reply) => {
					let Some(cr) = self.pending.iter().position(|&c| c == b'\r') else {
						break;
					};
					let line: Vec<u8> = self.pending.drain(..=cr).collect();
					assert_eq!(
						core::str::from_utf8(&line[..cr]).unwrap(),
						*expect,
						"unexpected command at script step {}",
						self.pos
					);
					modem.link_input().try_write(reply.as_bytes());
					self.pos += 1;
				}
				Step::Raw(expect, reply) => {
					if self.pending.len() < expect.len() {
						break;
					}
					let payload: Vec<u8> = self.pending.drain(..expect.len()).collect();
					assert_eq!(
						&payload[..],
						*expect,
						"unexpected payload at script step {}",
						self.pos
					);
					modem.link_input().try_write(reply.as_bytes());
					self.pos += 1;
				}
			}
		}
	}

	pub(crate) fn finished(&self) -> bool {
		self.pos == self.steps.len() && self.pending.is_empty()
	}
}

impl TestOptions {
	pub(crate) fn new() -> TestOptions {
		TestOptions {
			apn: "internet",
			pin: "",
			diagnostics: RefCell::new(Vec::new()),
		}
	}
}

impl ModemOptions for TestOptions {
	fn apn(&self) -> &str {
		self.apn
	}

	fn pin(&self) -> &str {
		self.pin
	}

	fn diagnostic(&self, kind: CallbackType, data: &[u8]) {
		self.diagnostics
			.borrow_mut()
			.push((kind, String::from_utf8_lossy(data).into_owned()));
	}
}

impl TestHardware {
	pub(crate) fn new() -> (TestHardware, Rc<RefCell<Vec<String>>>) {
		let log = Rc::new(RefCell::new(Vec::new()));
		(TestHardware { log: log.clone() }, log)
	}
}

impl ModemHardware for TestHardware {
	async fn power_on(&mut self) -> bool {
		self.log.borrow_mut().push("power on".into());
		true
	}

	async fn power_off(&mut self) {
		self.log.borrow_mut().push("power off".into());
	}

	fn set_baud_rate(&mut self, baud: u32) {
		self.log.borrow_mut().push(std::format!("baud {}", baud));
	}

	fn set_flow_control(&mut self, enabled: bool) {
		self.log
			.borrow_mut()
			.push(std::format!("flow control {}", enabled));
	}

	fn set_parity(&mut self, parity: Parity) {
		self.log
			.borrow_mut()
			.push(std::format!("parity {:?}", parity));
	}
}

//******************************************************************************
// Private Functions and Impl on Private Types
//******************************************************************************

// None

//******************************************************************************
// End of File
//******************************************************************************
