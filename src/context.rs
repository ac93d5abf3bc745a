//! Execution contexts.
//!
//! A [`Context`] is a dedicated worker thread that runs tasks one at a time, in submission
//! order. Resources that must only be touched from one place (a transaction's snapshot pin,
//! its blob reads) record the context they belong to, their *home*, and every access goes
//! through [`Context::run`], which hops onto that thread and blocks until the task is done.
//!
//! ```text
//!  caller thread                      home context worker
//!  ─────────────                      ───────────────────
//!  run(f) ── enqueue(task) ─────────► task() ─┐
//!     │                                        │
//!     └─ block on reply ◄──────── reply(r) ◄───┘
//! ```
//!
//! A hop from the home context to itself runs the task inline, so nested hops do not
//! deadlock the worker.

use crossbeam_channel::{bounded, unbounded, Sender};
use log::debug;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
	static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Identifies an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);

impl fmt::Display for ContextId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ctx#{}", self.0)
	}
}

struct Inner {
	id: ContextId,
	name: String,
	tasks: Sender<Task>,
}

/// Handle to an execution context. Cloning is cheap; the worker thread exits once the last
/// handle is gone and its queue has drained.
#[derive(Clone)]
pub struct Context {
	inner: Arc<Inner>,
}

impl fmt::Debug for Context {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Context").field("id", &self.inner.id).field("name", &self.inner.name).finish()
	}
}

impl Context {
	/// Starts a new context backed by its own worker thread.
	pub fn spawn(name: impl Into<String>) -> std::io::Result<Context> {
		let id = ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
		let name = name.into();
		let (tx, rx) = unbounded::<Task>();

		thread::Builder::new().name(name.clone()).spawn(move || {
			CURRENT.with(|c| c.set(Some(id)));
			debug!("context {} started", id);
			for task in rx {
				task();
			}
			debug!("context {} stopped", id);
		})?;

		Ok(Context {
			inner: Arc::new(Inner {
				id,
				name,
				tasks: tx,
			}),
		})
	}

	/// Returns the identifier of this context.
	pub fn id(&self) -> ContextId {
		self.inner.id
	}

	/// Returns the name given at spawn time.
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Returns the context the calling thread belongs to, if any.
	pub fn current() -> Option<ContextId> {
		CURRENT.with(|c| c.get())
	}

	/// Returns `true` if the calling thread is this context's worker.
	pub fn is_current(&self) -> bool {
		Self::current() == Some(self.inner.id)
	}

	/// Fails with [`Error::WrongContext`] unless called from this context.
	pub fn assert_current(&self) -> Result<()> {
		match Self::current() {
			Some(id) if id == self.inner.id => Ok(()),
			actual => Err(Error::WrongContext {
				expected: self.inner.id,
				actual,
			}),
		}
	}

	/// Runs `f` on this context and returns its result to the caller.
	///
	/// Runs inline when already on this context; otherwise the calling thread blocks until
	/// the worker has executed `f`. A panic inside `f` surfaces as [`Error::ContextClosed`]
	/// because the reply never arrives.
	pub fn run<F, R>(&self, f: F) -> Result<R>
	where
		F: FnOnce() -> R + Send + 'static,
		R: Send + 'static,
	{
		if self.is_current() {
			return Ok(f());
		}

		let (reply_tx, reply_rx) = bounded(1);
		let task: Task = Box::new(move || {
			let _ = reply_tx.send(f());
		});

		self.inner.tasks.send(task).map_err(|_| Error::ContextClosed(self.inner.id))?;
		reply_rx.recv().map_err(|_| Error::ContextClosed(self.inner.id))
	}
}
