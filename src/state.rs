//! # Application State Management
//!
//! Shared state that every HTTP handler and WebSocket actor can reach through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many handlers share ownership of the same data
//! - **Why needed**: Requests run concurrently on several worker threads
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Why needed**: Requests read the config constantly and update it rarely
//!
//! ### Trait objects (`Arc<dyn Trait>`)
//! - **Purpose**: The room store and the remote transport are chosen at startup
//! - **Why needed**: Tests swap in fakes without touching the handlers
//!
//! ## What lives here:
//! - Configuration (updatable at runtime)
//! - Request and call metrics
//! - The call registry, the room store and the live transport

use crate::call::gemini::GeminiLiveTransport;
use crate::call::registry::CallRegistry;
use crate::call::transport::LiveTransport;
use crate::config::AppConfig;
use crate::rooms::memory::InMemoryRoomStore;
use crate::rooms::store::RoomStore;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state shared across all handlers.
///
/// ## Thread Safety Pattern:
/// Mutable data sits behind `Arc<RwLock<T>>`; components with their own
/// internal locking (registry, store, transport) are shared as plain `Arc`s.
/// Cloning an `AppState` only clones the pointers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and call metrics, updated by middleware and the call gateway
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Calls currently owned by this server
    pub calls: Arc<CallRegistry>,

    /// Realtime message store behind the chat rooms
    pub rooms: Arc<dyn RoomStore>,

    /// Connection factory for the remote conversational audio endpoint
    pub transport: Arc<dyn LiveTransport>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all requests and calls.
///
/// ## Why these metrics matter:
/// - **request_count** / **error_count**: load and reliability
/// - **calls_started** / **calls_failed** / **calls_completed**: call health
/// - **endpoint_metrics**: per-route latency and errors
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub calls_started: u64,
    pub calls_failed: u64,
    pub calls_completed: u64,

    /// Key: method and route pattern (e.g., "GET /api/v1/rooms/{room}/messages")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    /// Cumulative processing time (milliseconds)
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// How a call ended, for the call counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Started,
    Failed,
    Completed,
}

impl AppState {
    /// Create the production state: in-memory rooms and the Gemini Live transport.
    pub fn new(config: AppConfig) -> Self {
        let rooms = Arc::new(InMemoryRoomStore::new(config.rooms.max_messages_per_room));
        let transport = Arc::new(GeminiLiveTransport::new(
            config.call.endpoint_url.clone(),
            config.call.api_key.clone(),
        ));
        Self::with_parts(config, rooms, transport)
    }

    /// Create a state around an explicit store and transport.
    pub fn with_parts(
        config: AppConfig,
        rooms: Arc<dyn RoomStore>,
        transport: Arc<dyn LiveTransport>,
    ) -> Self {
        let calls = Arc::new(CallRegistry::new(config.performance.max_concurrent_calls));
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            calls,
            rooms,
            transport,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// The call limit takes effect for calls started afterwards, the room
    /// history limit from the next published message.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.calls
            .set_max_concurrent_calls(new_config.performance.max_concurrent_calls);
        self.rooms
            .set_max_messages_per_room(new_config.rooms.max_messages_per_room);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record one request against its endpoint.
    ///
    /// The first time we see an endpoint a zeroed `EndpointMetric` is created.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_call(&self, outcome: CallOutcome) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            CallOutcome::Started => metrics.calls_started += 1,
            CallOutcome::Failed => metrics.calls_failed += 1,
            CallOutcome::Completed => metrics.calls_completed += 1,
        }
    }

    /// Consistent copy of the metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Total duration ÷ number of requests.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Errors ÷ requests, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
