#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use relaybot_domain::ConsumerId;
use tracing::warn;

/// Run one consumer callback, containing errors and panics.
///
/// Returns `true` when the callback completed successfully.
pub(crate) fn isolate<F>(consumer: &ConsumerId, callback: &'static str, f: F) -> bool
where
	F: FnOnce() -> anyhow::Result<()>,
{
	let failure = match catch_unwind(AssertUnwindSafe(f)) {
		Ok(Ok(())) => return true,
		Ok(Err(e)) => format!("{e:#}"),
		Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
	};

	metrics::counter!("relaybot_callback_failures_total", "callback" => callback).increment(1);
	warn!(%consumer, callback, error = %failure, "consumer callback failed");
	false
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
	if let Some(s) = panic.downcast_ref::<&'static str>() {
		s
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.as_str()
	} else {
		"non-string panic payload"
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn errors_and_panics_are_contained() {
		let id = ConsumerId::new("c1").unwrap();
		assert!(isolate(&id, "ok", || Ok(())));
		assert!(!isolate(&id, "err", || Err(anyhow::anyhow!("nope"))));
		assert!(!isolate(&id, "panic", || panic!("boom")));
	}
}
