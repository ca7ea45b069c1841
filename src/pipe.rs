//! # Byte pipes for simcomlib
//!
//! A fixed-capacity ring buffer with a cursor-based reader and a
//! back-pressured writer, shared between cooperating fibers. One pair
//! carries the serial link to the module, and every socket owns a pair for
//! its application-facing input and output.
//!
//! Positions are absolute byte offsets since the pipe was last reset, which
//! lets the driver reconcile its transmit cursor against the byte counts
//! the module reports.
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
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::waitqueue::WakerRegistration;

//******************************************************************************
// Types
//******************************************************************************

/// A fixed-capacity byte pipe between two cooperating fibers.
pub struct Pipe<const N: usize> {
	inner: RefCell<Inner<N>>,
}

/// Reading end of a [`Pipe`]. Cheap to copy; all state lives in the pipe.
#[derive(Copy, Clone)]
pub struct PipeReader<'a, const N: usize> {
	pipe: &'a Pipe<N>,
}

/// Writing end of a [`Pipe`]. Cheap to copy; all state lives in the pipe.
#[derive(Copy, Clone)]
pub struct PipeWriter<'a, const N: usize> {
	pipe: &'a Pipe<N>,
}

/// Absolute position in a pipe's byte stream since the last reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PipePosition(u64);

struct Inner<const N: usize> {
	buf: [u8; N],
	rd: u64,
	wr: u64,
	closed: bool,
	/// Woken when data arrives or the pipe closes.
	data_waker: WakerRegistration,
	/// Woken when space frees up or the pipe closes.
	space_waker: WakerRegistration,
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

impl PipePosition {
	/// Byte offset since the owning pipe was last reset.
	pub const fn offset(self) -> u64 {
		self.0
	}
}

impl<const N: usize> Pipe<N> {
	/// Create an empty, open pipe.
	pub const fn new() -> Pipe<N> {
		Pipe {
			inner: RefCell::new(Inner {
				buf: [0; N],
				rd: 0,
				wr: 0,
				closed: false,
				data_waker: WakerRegistration::new(),
				space_waker: WakerRegistration::new(),
			}),
		}
	}

	/// Get the reading end.
	pub fn reader(&self) -> PipeReader<'_, N> {
		PipeReader { pipe: self }
	}

	/// Get the writing end.
	pub fn writer(&self) -> PipeWriter<'_, N> {
		PipeWriter { pipe: self }
	}

	/// Close the pipe. Buffered bytes stay readable; readers then see EOF
	/// and writers are refused.
	pub fn close(&self) {
		let mut inner = self.inner.borrow_mut();
		if !inner.closed {
			inner.closed = true;
			inner.data_waker.wake();
			inner.space_waker.wake();
		}
	}

	/// Discard all buffered data and re-open the pipe at position zero.
	pub fn reset(&self) {
		let mut inner = self.inner.borrow_mut();
		inner.rd = 0;
		inner.wr = 0;
		inner.closed = false;
		inner.data_waker.wake();
		inner.space_waker.wake();
	}

	/// Whether the pipe has been closed.
	pub fn is_closed(&self) -> bool {
		self.inner.borrow().closed
	}
}

impl<'a, const N: usize> PipeReader<'a, N> {
	/// Current read position.
	pub fn position(self) -> PipePosition {
		PipePosition(self.pipe.inner.borrow().rd)
	}

	/// Number of buffered bytes available for reading.
	pub fn available(self) -> usize {
		let inner = self.pipe.inner.borrow();
		(inner.wr - inner.rd) as usize
	}

	/// Whether no further data will ever arrive.
	pub fn is_complete(self) -> bool {
		self.pipe.inner.borrow().closed
	}

	/// Peek at the buffered byte at `offset` without consuming it.
	///
	/// The byte must be available; peeking past the buffered data returns 0.
	pub fn peek(self, offset: usize) -> u8 {
		let inner = self.pipe.inner.borrow();
		if offset >= (inner.wr - inner.rd) as usize {
			debug_assert!(false, "peek past buffered data");
			return 0;
		}
		inner.buf[((inner.rd + offset as u64) % N as u64) as usize]
	}

	/// Copy buffered bytes into `dst` without consuming them.
	///
	/// Returns the number of bytes copied (bounded by availability).
	pub fn peek_copy(self, dst: &mut [u8]) -> usize {
		let inner = self.pipe.inner.borrow();
		let avail = (inner.wr - inner.rd) as usize;
		let count = dst.len().min(avail);
		for (i, slot) in dst[..count].iter_mut().enumerate() {
			*slot = inner.buf[((inner.rd + i as u64) % N as u64) as usize];
		}
		count
	}

	/// Consume `count` buffered bytes.
	pub fn advance(self, count: usize) {
		let mut inner = self.pipe.inner.borrow_mut();
		debug_assert!(count as u64 <= inner.wr - inner.rd);
		inner.rd += (count as u64).min(inner.wr - inner.rd);
		inner.space_waker.wake();
	}

	/// Consume everything up to an absolute position.
	pub fn advance_to(self, position: PipePosition) {
		let mut inner = self.pipe.inner.borrow_mut();
		debug_assert!(position.0 >= inner.rd && position.0 <= inner.wr);
		inner.rd = position.0.clamp(inner.rd, inner.wr);
		inner.space_waker.wake();
	}

	/// Suspend until at least `count` bytes are buffered, or the pipe
	/// closes. Returns the bytes available, which is less than `count`
	/// only at EOF.
	pub async fn require(self, count: usize) -> usize {
		poll_fn(|cx| {
			let mut inner = self.pipe.inner.borrow_mut();
			let avail = (inner.wr - inner.rd) as usize;
			if avail >= count || inner.closed {
				Poll::Ready(avail)
			} else {
				inner.data_waker.register(cx.waker());
				Poll::Pending
			}
		})
		.await
	}

	/// Suspend until `delimiter` appears in the buffered data. Returns the
	/// distance to it, including the delimiter itself, or 0 when the pipe
	/// closed before one arrived.
	pub async fn require_until(self, delimiter: u8) -> usize {
		poll_fn(|cx| {
			let mut inner = self.pipe.inner.borrow_mut();
			let avail = (inner.wr - inner.rd) as usize;
			for i in 0..avail {
				if inner.buf[((inner.rd + i as u64) % N as u64) as usize] == delimiter {
					return Poll::Ready(i + 1);
				}
			}
			if inner.closed {
				Poll::Ready(0)
			} else {
				inner.data_waker.register(cx.waker());
				Poll::Pending
			}
		})
		.await
	}

	/// Read into `dst`, suspending for at least one byte. Returns 0 at EOF.
	pub async fn read(self, dst: &mut [u8]) -> usize {
		if dst.is_empty() {
			return 0;
		}
		self.require(1).await;
		let count = self.peek_copy(dst);
		self.advance(count);
		count
	}

	/// Read whatever is buffered right now without suspending.
	pub fn try_read(self, dst: &mut [u8]) -> usize {
		let count = self.peek_copy(dst);
		self.advance(count);
		count
	}

	/// Expose the next contiguous readable chunk to `f` without consuming
	/// it. The chunk ends at the ring's wrap point; an empty slice means
	/// nothing is buffered.
	pub fn span<R>(self, f: impl FnOnce(&[u8]) -> R) -> R {
		let inner = self.pipe.inner.borrow();
		let avail = (inner.wr - inner.rd) as usize;
		let start = (inner.rd % N as u64) as usize;
		let len = avail.min(N - start);
		f(&inner.buf[start..start + len])
	}

	/// Whether the buffered data runs all the way to the ring's wrap
	/// point, so moving the contiguous chunk out frees a whole segment at
	/// once.
	pub fn available_full_segment(self) -> bool {
		let inner = self.pipe.inner.borrow();
		let avail = (inner.wr - inner.rd) as usize;
		let start = (inner.rd % N as u64) as usize;
		avail > 0 && start + avail >= N
	}

	/// Copy `count` bytes starting `offset` past the read position into
	/// another pipe, without consuming them here.
	///
	/// Transfers ring-to-ring, a contiguous segment at a time, suspending
	/// for space in the target; returns the bytes copied, short only when
	/// the target closed. The caller must have `offset + count` bytes
	/// buffered, and the target must be a different pipe.
	pub async fn copy_to<const M: usize>(
		self,
		target: PipeWriter<'_, M>,
		offset: usize,
		count: usize,
	) -> usize {
		let mut copied = 0;
		while copied < count {
			if target.wait_space().await.is_none() {
				break;
			}
			let n = {
				let src = self.pipe.inner.borrow();
				let mut dst = target.pipe.inner.borrow_mut();
				let avail = (src.wr - src.rd) as usize;
				let start = offset + copied;
				debug_assert!(start + (count - copied) <= avail);
				if start >= avail {
					0
				} else {
					let remaining = (count - copied).min(avail - start);
					let s_pos = ((src.rd + start as u64) % N as u64) as usize;
					let space = M - (dst.wr - dst.rd) as usize;
					let d_pos = (dst.wr % M as u64) as usize;
					let n = remaining
						.min(N - s_pos)
						.min(space.min(M - d_pos));
					dst.buf[d_pos..d_pos + n]
						.copy_from_slice(&src.buf[s_pos..s_pos + n]);
					dst.wr += n as u64;
					if n > 0 {
						dst.data_waker.wake();
					}
					n
				}
			};
			if n == 0 {
				break;
			}
			copied += n;
		}
		copied
	}

	/// Move `count` bytes into another pipe, consuming them here.
	///
	/// Transfers ring-to-ring, a contiguous segment at a time, suspending
	/// for source data and target space; returns the bytes moved, short
	/// when either side closed first. The target must be a different pipe.
	pub async fn move_to<const M: usize>(self, target: PipeWriter<'_, M>, count: usize) -> usize {
		let mut moved = 0;
		while moved < count {
			if self.require(1).await == 0 {
				break;
			}
			if target.wait_space().await.is_none() {
				break;
			}
			moved += self.transfer_into(target, count - moved);
		}
		moved
	}

	/// Copy as much as possible right now between the two rings, honouring
	/// both sides' segmentation, consuming from the source.
	fn transfer_into<const M: usize>(self, target: PipeWriter<'_, M>, max: usize) -> usize {
		let mut src = self.pipe.inner.borrow_mut();
		let mut dst = target.pipe.inner.borrow_mut();
		let mut copied = 0;
		while copied < max && !dst.closed {
			let avail = (src.wr - src.rd) as usize;
			let space = M - (dst.wr - dst.rd) as usize;
			if avail == 0 || space == 0 {
				break;
			}
			let s_pos = (src.rd % N as u64) as usize;
			let d_pos = (dst.wr % M as u64) as usize;
			let n = (max - copied)
				.min(avail.min(N - s_pos))
				.min(space.min(M - d_pos));
			dst.buf[d_pos..d_pos + n]
				.copy_from_slice(&src.buf[s_pos..s_pos + n]);
			src.rd += n as u64;
			dst.wr += n as u64;
			copied += n;
		}
		if copied > 0 {
			src.space_waker.wake();
			dst.data_waker.wake();
		}
		copied
	}
}

impl<'a, const N: usize> PipeWriter<'a, N> {
	/// Current write position.
	pub fn position(self) -> PipePosition {
		PipePosition(self.pipe.inner.borrow().wr)
	}

	/// Whether at least one more byte can be accepted.
	pub fn can_allocate(self) -> bool {
		let inner = self.pipe.inner.borrow();
		!inner.closed && ((inner.wr - inner.rd) as usize) < N
	}

	/// Whether the pipe has been closed.
	pub fn is_closed(self) -> bool {
		self.pipe.inner.borrow().closed
	}

	/// Write whatever fits right now without suspending. Returns the number
	/// of bytes accepted; 0 when full or closed.
	pub fn try_write(self, src: &[u8]) -> usize {
		let mut inner = self.pipe.inner.borrow_mut();
		if inner.closed {
			return 0;
		}
		let space = N - (inner.wr - inner.rd) as usize;
		let count = src.len().min(space);
		for (i, byte) in src[..count].iter().enumerate() {
			let index = ((inner.wr + i as u64) % N as u64) as usize;
			inner.buf[index] = *byte;
		}
		inner.wr += count as u64;
		if count > 0 {
			inner.data_waker.wake();
		}
		count
	}

	/// Write all of `src`, suspending for space as needed. Returns the
	/// bytes written, which is short only when the pipe closed.
	pub async fn write(self, src: &[u8]) -> usize {
		let mut written = 0;
		while written < src.len() {
			match self.wait_space().await {
				None => break,
				Some(()) => written += self.try_write(&src[written..]),
			}
		}
		written
	}

	/// Write the whole of `src`, suspending for space as needed. Returns
	/// whether every byte was accepted before the pipe closed.
	pub async fn write_all(self, src: &[u8]) -> bool {
		self.write(src).await == src.len()
	}

	/// Suspend until at least one byte of space is free, or the pipe
	/// closes (`None`).
	async fn wait_space(self) -> Option<()> {
		poll_fn(|cx| {
			let mut inner = self.pipe.inner.borrow_mut();
			if inner.closed {
				return Poll::Ready(None);
			}
			if ((inner.wr - inner.rd) as usize) < N {
				Poll::Ready(Some(()))
			} else {
				inner.space_waker.register(cx.waker());
				Poll::Pending
			}
		})
		.await
	}

	/// Close the pipe; see [`Pipe::close`].
	pub fn close(self) {
		self.pipe.close();
	}
}

//******************************************************************************
// Private Functions and Impl on Private Types
//******************************************************************************

// None

//******************************************************************************
// Tests
//******************************************************************************

#[cfg(test)]
mod test {
	use super::*;
	use crate::test_util::poll_once;
	use core::pin::pin;
	use core::task::Poll;

	#[test]
	fn write_then_read() {
		let pipe: Pipe<8> = Pipe::new();
		assert_eq!(pipe.writer().try_write(b"abc"), 3);
		assert_eq!(pipe.reader().available(), 3);
		assert_eq!(pipe.reader().peek(0), b'a');
		let mut buf = [0u8; 8];
		assert_eq!(pipe.reader().try_read(&mut buf), 3);
		assert_eq!(&buf[..3], b"abc");
	}

	#[test]
	fn writer_respects_capacity() {
		let pipe: Pipe<4> = Pipe::new();
		assert_eq!(pipe.writer().try_write(b"abcdef"), 4);
		assert_eq!(pipe.writer().try_write(b"x"), 0);
		pipe.reader().advance(2);
		assert_eq!(pipe.writer().try_write(b"xy"), 2);
		let mut buf = [0u8; 4];
		assert_eq!(pipe.reader().try_read(&mut buf), 4);
		assert_eq!(&buf, b"cdxy");
	}

	#[test]
	fn require_until_finds_delimiter() {
		let pipe: Pipe<16> = Pipe::new();
		pipe.writer().try_write(b"OK\rrest");
		let mut fut = pin!(pipe.reader().require_until(b'\r'));
		assert_eq!(poll_once(fut.as_mut()), Poll::Ready(3));
	}

	#[test]
	fn require_until_waits_for_delimiter() {
		let pipe: Pipe<16> = Pipe::new();
		pipe.writer().try_write(b"partial");
		{
			let mut fut = pin!(pipe.reader().require_until(b'\r'));
			assert_eq!(poll_once(fut.as_mut()), Poll::Pending);
			pipe.writer().try_write(b"\r");
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(8));
		}
	}

	#[test]
	fn require_until_eof_returns_zero() {
		let pipe: Pipe<16> = Pipe::new();
		pipe.writer().try_write(b"no line");
		pipe.close();
		let mut fut = pin!(pipe.reader().require_until(b'\r'));
		assert_eq!(poll_once(fut.as_mut()), Poll::Ready(0));
	}

	#[test]
	fn positions_advance_monotonically() {
		let pipe: Pipe<4> = Pipe::new();
		pipe.writer().try_write(b"ab");
		pipe.reader().advance(2);
		pipe.writer().try_write(b"cdef");
		assert_eq!(pipe.writer().position().offset(), 6);
		assert_eq!(pipe.reader().position().offset(), 2);
		pipe.reader().advance(4);
		assert_eq!(pipe.reader().position().offset(), 6);
	}

	#[test]
	fn span_exposes_contiguous_chunk() {
		let pipe: Pipe<4> = Pipe::new();
		pipe.writer().try_write(b"abcd");
		pipe.reader().advance(2);
		pipe.writer().try_write(b"ef");
		// readable data is "cdef" but the ring wraps after "cd"
		pipe.reader().span(|chunk| assert_eq!(chunk, b"cd"));
		assert!(pipe.reader().available_full_segment());
		pipe.reader().advance(2);
		pipe.reader().span(|chunk| assert_eq!(chunk, b"ef"));
		assert!(!pipe.reader().available_full_segment());
	}

	#[test]
	fn full_segment_needs_data() {
		let pipe: Pipe<4> = Pipe::new();
		assert!(!pipe.reader().available_full_segment());
		pipe.writer().try_write(b"abcd");
		assert!(pipe.reader().available_full_segment());
	}

	#[test]
	fn write_all_reports_closure() {
		let pipe: Pipe<8> = Pipe::new();
		{
			let mut fut = pin!(pipe.writer().write_all(b"abc"));
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(true));
		}
		pipe.close();
		{
			let mut fut = pin!(pipe.writer().write_all(b"d"));
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(false));
		}
	}

	#[test]
	fn move_to_crosses_the_wrap_point() {
		let src: Pipe<4> = Pipe::new();
		let dst: Pipe<8> = Pipe::new();
		src.writer().try_write(b"abcd");
		src.reader().advance(2);
		src.writer().try_write(b"ef");
		{
			let mut fut = pin!(src.reader().move_to(dst.writer(), 4));
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(4));
		}
		let mut buf = [0u8; 8];
		assert_eq!(dst.reader().try_read(&mut buf), 4);
		assert_eq!(&buf[..4], b"cdef");
	}

	#[test]
	fn copy_to_does_not_consume() {
		let src: Pipe<16> = Pipe::new();
		let dst: Pipe<16> = Pipe::new();
		src.writer().try_write(b"hello");
		{
			let mut fut = pin!(src.reader().copy_to(dst.writer(), 0, 5));
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(5));
		}
		assert_eq!(src.reader().available(), 5);
		let mut buf = [0u8; 16];
		assert_eq!(dst.reader().try_read(&mut buf), 5);
		assert_eq!(&buf[..5], b"hello");
	}

	#[test]
	fn move_to_consumes() {
		let src: Pipe<16> = Pipe::new();
		let dst: Pipe<16> = Pipe::new();
		src.writer().try_write(b"hello");
		{
			let mut fut = pin!(src.reader().move_to(dst.writer(), 5));
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(5));
		}
		assert_eq!(src.reader().available(), 0);
		assert_eq!(dst.reader().available(), 5);
	}

	#[test]
	fn move_to_stops_at_closed_target() {
		let src: Pipe<16> = Pipe::new();
		let dst: Pipe<16> = Pipe::new();
		src.writer().try_write(b"hello");
		dst.close();
		{
			let mut fut = pin!(src.reader().move_to(dst.writer(), 5));
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(0));
		}
		// unmoved bytes stay in the source for the caller to discard
		assert_eq!(src.reader().available(), 5);
	}

	#[test]
	fn closed_pipe_drains_then_eof() {
		let pipe: Pipe<16> = Pipe::new();
		pipe.writer().try_write(b"ab");
		pipe.close();
		assert_eq!(pipe.writer().try_write(b"c"), 0);
		{
			let mut fut = pin!(pipe.reader().require(1));
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(2));
		}
		pipe.reader().advance(2);
		{
			let mut fut = pin!(pipe.reader().require(1));
			assert_eq!(poll_once(fut.as_mut()), Poll::Ready(0));
		}
	}

	#[test]
	fn reset_reopens() {
		let pipe: Pipe<16> = Pipe::new();
		pipe.writer().try_write(b"old");
		pipe.close();
		pipe.reset();
		assert!(!pipe.is_closed());
		assert_eq!(pipe.reader().available(), 0);
		assert_eq!(pipe.writer().position().offset(), 0);
	}
}

//******************************************************************************
// End of File
//******************************************************************************
