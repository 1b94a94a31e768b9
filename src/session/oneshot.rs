// Stateless one-off streaming generation
//
// A reduced orchestrator: no history, no eager-submission queue. Each call
// is independent; only one may be in flight per instance, and abort is
// advisory exactly as in the chat orchestrator.

use crate::config::Config;
use crate::error::Result;
use crate::providers::GenerateOptions;
use crate::session::chat::StreamRun;
use crate::session::ModelSession;
use crate::log_debug;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

type TokenSubscriber = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct OneShotState {
	generating: bool,
	current: Option<Arc<StreamRun>>,
}

struct OneShotInner {
	session: ModelSession,
	state: Mutex<OneShotState>,
	defaults: GenerateOptions,
	on_token: Mutex<Option<TokenSubscriber>>,
}

#[derive(Clone)]
pub struct SingleShotStreamer {
	inner: Arc<OneShotInner>,
}

impl SingleShotStreamer {
	pub fn new(session: ModelSession, config: &Config) -> Self {
		let defaults = GenerateOptions {
			temperature: Some(config.generation.temperature),
			max_tokens: Some(config.generation.max_tokens),
			top_p: Some(config.generation.top_p),
			stop_sequences: None,
		};

		Self {
			inner: Arc::new(OneShotInner {
				session,
				state: Mutex::new(OneShotState {
					generating: false,
					current: None,
				}),
				defaults,
				on_token: Mutex::new(None),
			}),
		}
	}

	pub fn on_token(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) {
		*self.inner.on_token.lock() = Some(Arc::new(callback));
	}

	pub fn is_generating(&self) -> bool {
		self.inner.state.lock().generating
	}

	pub fn streaming_text(&self) -> String {
		let state = self.inner.state.lock();
		state
			.current
			.as_ref()
			.map(|run| run.text.lock().clone())
			.unwrap_or_default()
	}

	/// Stop surfacing tokens for the in-flight call. The engine computation
	/// itself continues; the call returns the partial text with a trailing
	/// ellipsis marker.
	pub fn stop(&self) {
		let mut state = self.inner.state.lock();
		if let Some(run) = state.current.take() {
			run.aborted.store(true, Ordering::SeqCst);
			state.generating = false;
			log_debug!("One-shot generation stopped");
		}
	}

	/// Run one independent streaming generation over a bare prompt. Returns
	/// `None` when another call is already in flight (dropped, not queued).
	pub async fn generate(&self, prompt: &str) -> Result<Option<String>> {
		let run = {
			let mut state = self.inner.state.lock();
			if state.generating {
				log_debug!("One-shot generation already in flight, dropping call");
				return Ok(None);
			}
			state.generating = true;
			let run = Arc::new(StreamRun::default());
			state.current = Some(run.clone());
			run
		};

		let subscriber = self.inner.on_token.lock().clone();
		let run_for_tokens = run.clone();
		let mut on_token = move |token: &str, full: &str| {
			if run_for_tokens.aborted.load(Ordering::SeqCst) {
				return;
			}
			*run_for_tokens.text.lock() = full.to_string();
			if let Some(callback) = &subscriber {
				callback(token, full);
			}
		};

		let result = self
			.inner
			.session
			.stream(prompt, &mut on_token, &self.inner.defaults)
			.await;

		if run.aborted.load(Ordering::SeqCst) {
			// stop() already reset state; surface what had accumulated
			let partial = run.text.lock().clone();
			return Ok(Some(format!("{}...", partial)));
		}

		{
			let mut state = self.inner.state.lock();
			if let Some(current) = &state.current {
				if Arc::ptr_eq(current, &run) {
					state.current = None;
				}
			}
			state.generating = false;
		}

		result.map(Some)
	}
}
