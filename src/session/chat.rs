// Chat orchestrator: one logical, stateful conversation
//
// Owns conversation history, the single eager-submission slot, streaming
// accumulation and cancellation. History mutations and generation starts are
// strictly serialized by the reentrancy guard; no two generations ever
// interleave their token streams into the same history.

use crate::config::Config;
use crate::error::{ProviderError, Result};
use crate::providers::{ChatMessage, GenerateOptions, Role};
use crate::session::{ModelSession, SessionPhase};
use crate::{log_debug, log_error};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What happened to a `send` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
	/// Generation ran to completion (or settled via stop/error)
	Generated,
	/// Model still loading; message queued for automatic submission
	Queued,
	/// A generation was already in flight; the submission was dropped
	Dropped,
	/// Session is neither ready nor loading; nothing was done
	Ignored,
}

/// State scoped to a single in-flight generation. Discarded on completion;
/// on abort the flag makes every later token of that run invisible.
#[derive(Default)]
pub(crate) struct StreamRun {
	pub aborted: AtomicBool,
	pub text: Mutex<String>,
}

type TokenSubscriber = Arc<dyn Fn(&str, &str) + Send + Sync>;
type ErrorSubscriber = Arc<dyn Fn(&ProviderError) + Send + Sync>;

struct ChatState {
	history: Vec<ChatMessage>,
	seed: Vec<ChatMessage>,
	/// At most one queued user message; a second eager send overwrites it
	pending: Option<String>,
	generating: bool,
	current: Option<Arc<StreamRun>>,
	waiter_started: bool,
}

struct ChatInner {
	session: ModelSession,
	state: Mutex<ChatState>,
	defaults: GenerateOptions,
	on_token: Mutex<Option<TokenSubscriber>>,
	on_error: Mutex<Option<ErrorSubscriber>>,
}

#[derive(Clone)]
pub struct ChatOrchestrator {
	inner: Arc<ChatInner>,
}

impl ChatOrchestrator {
	pub fn new(session: ModelSession, config: &Config) -> Self {
		// Generation defaults belong to this layer, never to the adapters
		let defaults = GenerateOptions {
			temperature: Some(config.generation.temperature),
			max_tokens: Some(config.generation.max_tokens),
			top_p: Some(config.generation.top_p),
			stop_sequences: None,
		};

		Self {
			inner: Arc::new(ChatInner {
				session,
				state: Mutex::new(ChatState {
					history: Vec::new(),
					seed: Vec::new(),
					pending: None,
					generating: false,
					current: None,
					waiter_started: false,
				}),
				defaults,
				on_token: Mutex::new(None),
				on_error: Mutex::new(None),
			}),
		}
	}

	/// Start the conversation from caller-supplied messages; `clear` resets
	/// back to this seed
	pub fn with_seed(self, seed: Vec<ChatMessage>) -> Self {
		{
			let mut state = self.inner.state.lock();
			state.seed = seed.clone();
			state.history = seed;
		}
		self
	}

	/// Subscribe to incremental tokens: `(token, full_text_so_far)`
	pub fn on_token(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) {
		*self.inner.on_token.lock() = Some(Arc::new(callback));
	}

	/// Subscribe to generation errors
	pub fn on_error(&self, callback: impl Fn(&ProviderError) + Send + Sync + 'static) {
		*self.inner.on_error.lock() = Some(Arc::new(callback));
	}

	pub fn session(&self) -> &ModelSession {
		&self.inner.session
	}

	pub fn history(&self) -> Vec<ChatMessage> {
		self.inner.state.lock().history.clone()
	}

	pub fn is_pending(&self) -> bool {
		self.inner.state.lock().pending.is_some()
	}

	pub fn is_generating(&self) -> bool {
		self.inner.state.lock().generating
	}

	/// Text accumulated by the in-flight generation, empty when idle
	pub fn streaming_text(&self) -> String {
		let state = self.inner.state.lock();
		state
			.current
			.as_ref()
			.map(|run| run.text.lock().clone())
			.unwrap_or_default()
	}

	/// Submit a user message. Ready -> generate now; loading -> append to
	/// history immediately and queue for automatic submission on readiness;
	/// otherwise a no-op. While a generation is in flight the submission is
	/// dropped, not queued.
	pub async fn send(&self, text: impl Into<String>) -> Result<SendOutcome> {
		let text = text.into();

		enum Action {
			Generate,
			Queue { spawn_waiter: bool },
			Busy,
			Ignore,
		}

		let action = {
			let mut state = self.inner.state.lock();
			if state.generating {
				Action::Busy
			} else {
				match self.inner.session.phase() {
					SessionPhase::Ready => {
						state.history.push(ChatMessage::user(text.clone()));
						Action::Generate
					}
					SessionPhase::Loading => {
						state.history.push(ChatMessage::user(text.clone()));
						if state.pending.replace(text.clone()).is_some() {
							log_debug!("Pending submission overwritten by a newer send");
						}
						let spawn_waiter = !state.waiter_started;
						state.waiter_started = true;
						Action::Queue { spawn_waiter }
					}
					SessionPhase::Failed | SessionPhase::Closed => Action::Ignore,
				}
			}
		};

		match action {
			Action::Generate => {
				self.generate_from_history().await;
				Ok(SendOutcome::Generated)
			}
			Action::Queue { spawn_waiter } => {
				if spawn_waiter {
					self.spawn_ready_waiter();
				}
				Ok(SendOutcome::Queued)
			}
			Action::Busy => {
				log_debug!("Generation already in flight, dropping submission");
				Ok(SendOutcome::Dropped)
			}
			Action::Ignore => {
				log_debug!("Session is not ready and not loading, ignoring submission");
				Ok(SendOutcome::Ignored)
			}
		}
	}

	/// Stop surfacing tokens for the in-flight generation. The engine's
	/// computation is NOT cancelled; its remaining output is discarded. The
	/// partial text is committed to history with a trailing ellipsis marker.
	pub fn stop(&self) {
		let mut state = self.inner.state.lock();
		let Some(run) = state.current.take() else {
			return;
		};
		run.aborted.store(true, Ordering::SeqCst);
		let partial = run.text.lock().clone();
		state.history.push(ChatMessage::assistant(format!("{}...", partial)));
		state.generating = false;
		log_debug!("Generation stopped, remaining engine output will be discarded");
	}

	/// Regenerate the response to the most recent user message: truncate
	/// history to just before it and resubmit its text through `send`
	pub async fn reload(&self) -> Result<SendOutcome> {
		let text = {
			let mut state = self.inner.state.lock();
			if state.generating {
				return Ok(SendOutcome::Dropped);
			}
			let Some(index) = state.history.iter().rposition(|m| m.role == Role::User) else {
				return Ok(SendOutcome::Ignored);
			};
			let text = state.history[index].content.as_text();
			state.history.truncate(index);
			text
		};
		self.send(text).await
	}

	/// Reset history to the seed. Any queued submission is dropped with it.
	pub fn clear(&self) {
		let mut state = self.inner.state.lock();
		state.history = state.seed.clone();
		state.pending = None;
	}

	/// One-shot consumer of the session's "became ready" notification:
	/// releases the queued submission the instant the model is usable.
	fn spawn_ready_waiter(&self) {
		let this = self.clone();
		tokio::spawn(async move {
			let mut rx = this.inner.session.phase_watch();
			loop {
				if this.inner.session.phase() == SessionPhase::Ready {
					this.flush_pending().await;
					break;
				}
				if rx.changed().await.is_err() {
					break;
				}
			}
		});
	}

	async fn flush_pending(&self) {
		let has_pending = {
			let mut state = self.inner.state.lock();
			state.waiter_started = false;
			// The queued message is already in history; the slot only
			// triggers the generation
			state.pending.take().is_some()
		};
		if has_pending {
			self.generate_from_history().await;
		}
	}

	/// Run one generation over the full history. Guarded: a call while one
	/// is already in flight does nothing.
	async fn generate_from_history(&self) {
		let run = {
			let mut state = self.inner.state.lock();
			if state.generating {
				log_debug!("Reentrant generation attempt ignored");
				return;
			}
			state.generating = true;
			let run = Arc::new(StreamRun::default());
			state.current = Some(run.clone());
			run
		};

		let history = self.inner.state.lock().history.clone();
		let subscriber = self.inner.on_token.lock().clone();

		let run_for_tokens = run.clone();
		let mut on_token = move |token: &str, full: &str| {
			// Tokens arriving after stop() are discarded, not surfaced
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
			.stream(history, &mut on_token, &self.inner.defaults)
			.await;

		if run.aborted.load(Ordering::SeqCst) {
			// stop() already committed the partial text and reset state;
			// this stale completion is never surfaced
			log_debug!("Discarding completion of a stopped generation");
			return;
		}

		let error = {
			let mut state = self.inner.state.lock();
			if let Some(current) = &state.current {
				if Arc::ptr_eq(current, &run) {
					state.current = None;
				}
			}
			state.generating = false;
			match result {
				Ok(text) => {
					state.history.push(ChatMessage::assistant(text));
					None
				}
				Err(err) => {
					// History is not corrupted by a failed request; a
					// visible error message ends the turn instead
					state
						.history
						.push(ChatMessage::assistant(format!("Something went wrong: {}", err)));
					Some(err)
				}
			}
		};

		if let Some(err) = error {
			log_error!("Generation failed: {}", err);
			let callback = self.inner.on_error.lock().clone();
			if let Some(callback) = callback {
				callback(&err);
			}
		}
	}
}

// Convenience for tests and callers inspecting history
impl ChatOrchestrator {
	pub fn last_message(&self) -> Option<ChatMessage> {
		self.inner.state.lock().history.last().cloned()
	}
}
