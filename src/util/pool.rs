use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::error::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker set over a shared queue. `join` blocks until the
/// queue and all in-flight jobs drain; the pool stays usable afterwards.
pub struct Pool {
	tx: Option<Sender<Job>>,
	workers: Vec<JoinHandle<()>>,
	pending: Arc<(Mutex<u64>, Condvar)>,
}

impl Pool {
	pub fn new(threads: usize) -> Result<Pool> {
		let threads = threads.max(1);
		let (tx, rx) = unbounded::<Job>();
		let pending = Arc::new((Mutex::new(0u64), Condvar::new()));

		let mut workers = Vec::with_capacity(threads);
		for i in 0..threads {
			let rx = rx.clone();
			let pending = pending.clone();
			let handle = thread::Builder::new()
				.name(format!("entwine-worker-{}", i))
				.spawn(move || {
					while let Ok(job) = rx.recv() {
						if catch_unwind(AssertUnwindSafe(job)).is_err() {
							error!("worker job panicked");
						}
						let mut n = pending.0.lock();
						*n -= 1;
						if *n == 0 {
							pending.1.notify_all();
						}
					}
				})?;
			workers.push(handle);
		}

		Ok(Pool {
			tx: Some(tx),
			workers,
			pending,
		})
	}

	pub fn add<F>(&self, job: F)
	where
		F: FnOnce() + Send + 'static,
	{
		{
			let mut n = self.pending.0.lock();
			*n += 1;
		}
		if let Some(tx) = &self.tx {
			if tx.send(Box::new(job)).is_err() {
				let mut n = self.pending.0.lock();
				*n -= 1;
			}
		}
	}

	pub fn join(&self) {
		let mut n = self.pending.0.lock();
		while *n > 0 {
			self.pending.1.wait(&mut n);
		}
	}
}

impl Drop for Pool {
	fn drop(&mut self) {
		self.tx.take();
		for handle in self.workers.drain(..) {
			let _ = handle.join();
		}
	}
}
