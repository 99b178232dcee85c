//! Mock Backends for CI and Testing
//!
//! Loaders and backends that need no accelerator, model files or network.
//! Latency, load failures and faults are scriptable at runtime, and every
//! load / call / release is counted.

use ferrovox_kernel::{
    Backend, BackendCapabilities, BackendError, BackendHandle, BackendLoader, BackendResult,
    LoadRequest, SpeechScore, StageInput, StageOutput,
};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// What a mock backend answers with
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// Audio becomes a transcript describing its length; text is echoed back
    Echo,
    Text(String),
    Transcript(String),
    Speech(SpeechScore),
    Empty,
}

/// Queue of faults returned by the next calls, one per call.
#[derive(Debug, Clone, Default)]
pub struct FaultScript {
    queue: Arc<Mutex<VecDeque<BackendError>>>,
}

impl FaultScript {
    pub fn push(&self, fault: BackendError) {
        self.queue.lock().push_back(fault);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn next(&self) -> Option<BackendError> {
        self.queue.lock().pop_front()
    }
}

#[derive(Debug, Default)]
struct MockShared {
    latency_ms: AtomicU64,
    load_latency_ms: AtomicU64,
    fail_load: AtomicBool,
    response: RwLock<Option<MockResponse>>,
    persistent_fault: RwLock<Option<BackendError>>,
    loads: AtomicUsize,
    calls: AtomicUsize,
    releases: AtomicUsize,
}

/// Scriptable loader; every handle it produces shares its knobs and counters.
pub struct MockBackendLoader {
    identifier: String,
    shared: Arc<MockShared>,
    faults: FaultScript,
}

impl MockBackendLoader {
    pub fn new(identifier: impl Into<String>) -> Self {
        let shared = MockShared::default();
        *shared.response.write() = Some(MockResponse::Echo);
        Self {
            identifier: identifier.into(),
            shared: Arc::new(shared),
            faults: FaultScript::default(),
        }
    }

    /// Detector that always returns `score`
    pub fn detector(identifier: impl Into<String>, score: SpeechScore) -> Self {
        Self::new(identifier).with_response(MockResponse::Speech(score))
    }

    pub fn with_response(self, response: MockResponse) -> Self {
        *self.shared.response.write() = Some(response);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn with_load_latency(self, latency: Duration) -> Self {
        self.shared
            .load_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn failing_load(self) -> Self {
        self.set_fail_load(true);
        self
    }

    pub fn with_fault_on_every_call(self, fault: BackendError) -> Self {
        *self.shared.persistent_fault.write() = Some(fault);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.shared.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn set_response(&self, response: MockResponse) {
        *self.shared.response.write() = Some(response);
    }

    /// Faults consumed by the next calls of any handle from this loader
    pub fn fault_script(&self) -> FaultScript {
        self.faults.clone()
    }

    pub fn load_count(&self) -> usize {
        self.shared.loads.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }
}

impl BackendLoader for MockBackendLoader {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn load(&self, request: &LoadRequest) -> BackendResult<BackendHandle> {
        let delay = self.shared.load_latency_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.shared.fail_load.load(Ordering::SeqCst) {
            return Err(BackendError::internal(format!(
                "mock load of {} on {} refused",
                request.identifier,
                request.device_label()
            )));
        }
        self.shared.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockBackend {
            name: self.identifier.clone(),
            shared: self.shared.clone(),
            faults: self.faults.clone(),
        }))
    }
}

/// Handle produced by [`MockBackendLoader`]
pub struct MockBackend {
    name: String,
    shared: Arc<MockShared>,
    faults: FaultScript,
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        let probability = matches!(
            *self.shared.response.read(),
            Some(MockResponse::Speech(SpeechScore::Probability(_)))
        );
        BackendCapabilities {
            release: true,
            probability,
        }
    }

    fn operate(&self, input: StageInput) -> BackendResult<StageOutput> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.shared.latency_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        if let Some(fault) = self.faults.next() {
            return Err(fault);
        }
        if let Some(fault) = self.shared.persistent_fault.read().clone() {
            return Err(fault);
        }

        let response = self
            .shared
            .response
            .read()
            .clone()
            .unwrap_or(MockResponse::Echo);
        Ok(match (response, input) {
            (MockResponse::Echo, StageInput::Audio(samples)) => StageOutput::Transcript {
                text: format!("transcribed {} samples", samples.len()),
                confidence: None,
            },
            (MockResponse::Echo, StageInput::Text(text)) => StageOutput::Text(text),
            (MockResponse::Text(text), _) => StageOutput::Text(text),
            (MockResponse::Transcript(text), _) => StageOutput::Transcript {
                text,
                confidence: None,
            },
            (MockResponse::Speech(score), _) => StageOutput::Speech(score),
            (MockResponse::Empty, _) => StageOutput::Empty,
        })
    }

    fn release(&self) -> BackendResult<()> {
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
