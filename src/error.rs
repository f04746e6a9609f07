use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "config.max_batch_size", "request.endpoint")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., batch id, observed value)
    pub details: Option<String>,
    /// Source of the error (e.g., "batch_queue", "processor_registry")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the queue refused a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKind {
    QueueFull,
    MemoryLimit,
}

impl std::fmt::Display for AdmissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionKind::QueueFull => write!(f, "queue full"),
            AdmissionKind::MemoryLimit => write!(f, "memory limit"),
        }
    }
}

/// Unified error type for the batching pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Admission rejected ({kind}): {message}{}", format_context(.context))]
    Admission {
        kind: AdmissionKind,
        message: String,
        context: ErrorContext,
    },

    #[error("Optimization error: {message}{}", format_context(.context))]
    Optimization {
        message: String,
        context: ErrorContext,
    },

    #[error("Processing error: {message}{}", format_context(.context))]
    Processing {
        message: String,
        retryable: bool,
        context: ErrorContext,
    },

    /// `half_open` is set when the circuit is letting a single trial call through and this call
    /// was turned away while the trial call runs.
    #[error("Circuit breaker open (retry in {retry_in_ms} ms)")]
    CircuitOpen { retry_in_ms: u64, half_open: bool },

    #[error("Rate limited by backend: {message} (retry after {retry_after_ms} ms)")]
    RateLimited { message: String, retry_after_ms: u64 },

    #[error("Batch manager is shutting down")]
    Shutdown,

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new admission error with structured context
    pub fn admission(kind: AdmissionKind, msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Admission {
            kind,
            message: msg.into(),
            context,
        }
    }

    /// Create a new processing error; `retryable` tells the retry wrapper whether to try again.
    pub fn processing(msg: impl Into<String>, retryable: bool) -> Self {
        Error::Processing {
            message: msg.into(),
            retryable,
            context: ErrorContext::new().with_source("processor"),
        }
    }

    /// The backend refused the batch for `retry_after` (e.g. HTTP 429 with `Retry-After`).
    ///
    /// Dispatch pauses for the window and then retries.
    pub fn rate_limited(msg: impl Into<String>, retry_after: std::time::Duration) -> Self {
        Error::RateLimited {
            message: msg.into(),
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }

    /// Create a new optimization error with structured context
    pub fn optimization_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Optimization {
            message: msg.into(),
            context,
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Whether the retry wrapper may attempt the failed operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Processing { retryable, .. } => *retryable,
            Error::RateLimited { .. } | Error::Runtime { .. } | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Short, stable name used when categorizing per-request failures.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Admission { .. } => "AdmissionError",
            Error::Optimization { .. } => "OptimizationError",
            Error::Processing { .. } => "ProcessingError",
            Error::CircuitOpen { .. } => "CircuitOpenError",
            Error::RateLimited { .. } => "RateLimitedError",
            Error::Shutdown => "ShutdownError",
            Error::Configuration { .. } => "ConfigurationError",
            Error::Validation { .. } => "ValidationError",
            Error::Runtime { .. } => "RuntimeError",
            Error::Io(_) => "IoError",
            Error::Serialization(_) | Error::Yaml(_) => "SerializationError",
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Admission { context, .. }
            | Error::Optimization { context, .. }
            | Error::Processing { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }
}
