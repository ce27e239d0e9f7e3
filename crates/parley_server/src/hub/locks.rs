#![forbid(unsafe_code)]

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;

/// Striped async locks: each key maps onto one of a fixed set of mutexes.
///
/// Two keys may share a stripe, so holders must never lock the same table
/// twice through separate calls; use [`KeyedLocks::lock_many`] instead.
pub struct KeyedLocks {
	stripes: Vec<Arc<tokio::sync::Mutex<()>>>,
	hasher: RandomState,
}

/// Guards returned by [`KeyedLocks::lock_many`], released on drop.
pub struct KeyedGuard {
	_guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
	pub fn new(stripes: usize) -> Self {
		let stripes = stripes.max(1);
		Self {
			stripes: (0..stripes).map(|_| Arc::new(tokio::sync::Mutex::new(()))).collect(),
			hasher: RandomState::new(),
		}
	}

	fn stripe_of<K: Hash + ?Sized>(&self, key: &K) -> usize {
		(self.hasher.hash_one(key) as usize) % self.stripes.len()
	}

	pub async fn lock<K: Hash + ?Sized>(&self, key: &K) -> KeyedGuard {
		let idx = self.stripe_of(key);
		KeyedGuard {
			_guards: vec![Arc::clone(&self.stripes[idx]).lock_owned().await],
		}
	}

	/// Lock every stripe covering `keys`, in ascending stripe order.
	pub async fn lock_many<K: Hash + ?Sized>(&self, keys: &[&K]) -> KeyedGuard {
		let mut idxs: Vec<usize> = keys.iter().map(|k| self.stripe_of(*k)).collect();
		idxs.sort_unstable();
		idxs.dedup();

		let mut guards = Vec::with_capacity(idxs.len());
		for idx in idxs {
			guards.push(Arc::clone(&self.stripes[idx]).lock_owned().await);
		}
		KeyedGuard { _guards: guards }
	}
}

/// Lock a table mutex; state stays usable after a panic elsewhere.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
	m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn same_key_is_serialized() {
		let locks = Arc::new(KeyedLocks::new(8));
		let inside = Arc::new(AtomicUsize::new(0));
		let max_seen = Arc::new(AtomicUsize::new(0));

		let mut tasks = Vec::new();
		for _ in 0..8 {
			let locks = Arc::clone(&locks);
			let inside = Arc::clone(&inside);
			let max_seen = Arc::clone(&max_seen);
			tasks.push(tokio::spawn(async move {
				let _g = locks.lock("alice").await;
				let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
				max_seen.fetch_max(now, Ordering::SeqCst);
				tokio::time::sleep(Duration::from_millis(2)).await;
				inside.fetch_sub(1, Ordering::SeqCst);
			}));
		}
		for t in tasks {
			t.await.unwrap();
		}
		assert_eq!(max_seen.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn lock_many_tolerates_shared_stripes() {
		// One stripe: every key collides, which must not self-deadlock.
		let locks = KeyedLocks::new(1);
		let _g = locks.lock_many(&["a", "b", "a"]).await;
	}
}
