//! In-memory actuator for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Actuator, ActuatorError, PageState, Viewport, WaitUntil};

pub(crate) const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G'];

/// Records every call and fails on demand.
pub(crate) struct ScriptedActuator {
    initialized: AtomicBool,
    init_calls: AtomicU32,
    init_failures: AtomicU32,
    failures: Mutex<HashMap<String, String>>,
    page: Mutex<PageState>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedActuator {
    pub(crate) fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            init_calls: AtomicU32::new(0),
            init_failures: AtomicU32::new(0),
            failures: Mutex::new(HashMap::new()),
            page: Mutex::new(PageState {
                url: "about:blank".to_string(),
                title: String::new(),
                viewport: Some(Viewport {
                    width: 1280,
                    height: 800,
                }),
                ready_state: Some("complete".to_string()),
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn initialized() -> Self {
        let actuator = Self::new();
        actuator.initialized.store(true, Ordering::SeqCst);
        actuator
    }

    pub(crate) fn fail_next_inits(&self, count: u32) {
        self.init_failures.store(count, Ordering::SeqCst);
    }

    /// Make every later call of `operation` fail with `message`.
    pub(crate) fn fail_operation(&self, operation: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(operation.to_string(), message.to_string());
    }

    pub(crate) fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String, operation: &str) -> Result<(), ActuatorError> {
        self.calls.lock().unwrap().push(call);
        if let Some(message) = self.failures.lock().unwrap().get(operation) {
            return Err(ActuatorError::Operation(message.clone()));
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ActuatorError::NotInitialized);
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for ScriptedActuator {
    async fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<(), ActuatorError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.init_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.init_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ActuatorError::Connection {
                endpoint: "scripted".to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        _timeout: Duration,
    ) -> Result<String, ActuatorError> {
        self.record(format!("navigate:{}:{}", wait_until, url), "navigate")?;
        let mut page = self.page.lock().unwrap();
        page.url = url.to_string();
        page.title = format!("Title of {}", url);
        Ok(format!("<html><body>{}</body></html>", url))
    }

    async fn content(&self) -> Result<String, ActuatorError> {
        self.record("content".to_string(), "content")?;
        let page = self.page.lock().unwrap();
        Ok(format!("<html><body>{}</body></html>", page.url))
    }

    async fn capture_screenshot(&self, full_page: bool) -> Result<Vec<u8>, ActuatorError> {
        self.record(format!("screenshot:{}", full_page), "screenshot")?;
        Ok(FAKE_PNG.to_vec())
    }

    async fn page_state(&self) -> Result<PageState, ActuatorError> {
        self.record("page_state".to_string(), "page_state")?;
        Ok(self.page.lock().unwrap().clone())
    }

    async fn click(&self, selector: &str, _timeout: Duration) -> Result<(), ActuatorError> {
        self.record(format!("click:{}", selector), "click")
    }

    async fn type_text(
        &self,
        selector: &str,
        text: &str,
        _delay: Duration,
    ) -> Result<(), ActuatorError> {
        self.record(format!("type:{}:{}", selector, text), "type_text")
    }

    async fn wait(&self, duration: Duration) -> Result<(), ActuatorError> {
        self.record(format!("wait:{}", duration.as_millis()), "wait")
    }

    async fn close(&self) -> Result<(), ActuatorError> {
        self.calls.lock().unwrap().push("close".to_string());
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}
