use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the provider engine.
///
/// The type is `Clone` so a failed asynchronous build can be handed to
/// every reader that awaited the same in-flight result. It stays `Send + Sync`
/// so build functions can propagate it with `?` into `anyhow::Result`.
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// No enclosing scope declares the provider.
	#[error("provider `{provider}` is not available in this scope")]
	ProviderNotAvailable { provider: String },

	/// Two live providers of different types claim the same backing key.
	#[error("`{key}` is already bound to {existing}, cannot bind {requested}")]
	DuplicateBinding {
		key: String,
		existing: &'static str,
		requested: &'static str,
	},

	/// The unit was disposed and accepts no further mutation.
	#[error("unit `{unit}` is closed")]
	ClosedUnit { unit: String },

	/// The unit has no value to update yet.
	#[error("unit `{unit}` has not settled")]
	Unsettled { unit: String },

	/// A build function failed. The unit stays uncomputed.
	#[error("failed to build `{provider}`: {cause:#}")]
	BuildFailure {
		provider: String,
		cause: Arc<anyhow::Error>,
	},

	/// A watch edge failed to invalidate its dependent.
	#[error("failed to invalidate `{watcher}`")]
	Invalidation {
		watcher: String,
		#[source]
		source: Box<Error>,
	},

	#[error("circular dependency: {}", path.join(" -> "))]
	CircularDependency { path: Vec<String> },

	/// The scope was torn down.
	#[error("scope `{scope}` is disposed")]
	ScopeDisposed { scope: String },

	/// Another live scope already uses this id in the same store.
	#[error("scope `{scope}` is already mounted")]
	ScopeMounted { scope: String },

	/// A key resolved to a unit of another type.
	#[error("provider `{provider}` does not hold a value of type {expected}")]
	Mismatch {
		provider: String,
		expected: &'static str,
	},
}

impl Error {
	pub(crate) fn build(provider: &str, cause: anyhow::Error) -> Self {
		Error::BuildFailure {
			provider: provider.to_owned(),
			cause: Arc::new(cause),
		}
	}

	pub(crate) fn not_available(provider: &str) -> Self {
		Error::ProviderNotAvailable {
			provider: provider.to_owned(),
		}
	}

	/// Follows nested build failures and invalidations down to the engine
	/// error that started the chain.
	pub fn root(&self) -> &Error {
		match self {
			Error::BuildFailure { cause, .. } => match cause.downcast_ref::<Error>() {
				Some(inner) => inner.root(),
				None => self,
			},
			Error::Invalidation { source, .. } => source.root(),
			_ => self,
		}
	}

	/// Returns `true` when the error originates from a failing build function.
	pub fn is_build_failure(&self) -> bool {
		match self {
			Error::BuildFailure { .. } => true,
			Error::Invalidation { source, .. } => source.is_build_failure(),
			_ => false,
		}
	}
}
