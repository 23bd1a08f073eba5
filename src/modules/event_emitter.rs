//! Diagnostic `eventemitter` module
//!
//! Emits a test event on demand so the subscription machinery can be observed
//! from the outside:
//!
//! - `emitTestEvent {text?}` always emits `eventemitter.monitoringEvent`, and
//!   emits `eventemitter.testEvent` only while that event is enabled here
//! - `isSubscribed` reports the local gate of `eventemitter.testEvent`
//! - `echo`, `sleep {ms}` and `fail {message?}` exercise command plumbing
//! - `crash` panics, taking the realm handler down with it

use crate::core::handle::AddressableHandle;
use crate::error::ModuleError;
use crate::handler::module::{Module, ModuleContext};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub const EVENT_EMITTER_MODULE: &str = "eventemitter";
pub const TEST_EVENT: &str = "eventemitter.testEvent";
pub const MONITORING_EVENT: &str = "eventemitter.monitoringEvent";

pub struct EventEmitterModule {
    handle: AddressableHandle,
    /// Number of emitTestEvent calls handled
    emitted: u64,
}

impl EventEmitterModule {
    pub fn new(handle: AddressableHandle) -> Self {
        Self { handle, emitted: 0 }
    }

    pub fn factory(handle: &AddressableHandle) -> Box<dyn Module> {
        Box::new(Self::new(*handle))
    }

    fn emit_test_event(&mut self, params: &Value, ctx: &ModuleContext<'_>) -> Value {
        self.emitted += 1;
        let text = params
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("event {} from {}", self.emitted, self.handle));

        let delivered = ctx.emit_event(TEST_EVENT, json!({ "text": text }));
        ctx.emit_monitoring(MONITORING_EVENT, json!({ "text": text }));
        json!({ "emitted": delivered })
    }
}

#[async_trait]
impl Module for EventEmitterModule {
    async fn handle_command(
        &mut self,
        command: &str,
        params: Value,
        ctx: &ModuleContext<'_>,
    ) -> Result<Value, ModuleError> {
        match command {
            "emitTestEvent" => Ok(self.emit_test_event(&params, ctx)),
            "isSubscribed" => Ok(Value::Bool(ctx.is_event_enabled(TEST_EVENT))),
            "echo" => Ok(params),
            "sleep" => {
                let ms = params
                    .get("ms")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| anyhow!("sleep requires a numeric 'ms' parameter"))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept": ms }))
            }
            "fail" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure");
                Err(anyhow!("{}", message).into())
            }
            "crash" => panic!("{} asked to crash", self.handle),
            other => Err(ModuleError::UnknownCommand(other.to_string())),
        }
    }

    fn on_event_gate(&mut self, event_name: &str, enabled: bool) {
        log::debug!(
            "{}: {} {}",
            self.handle,
            event_name,
            if enabled { "now emitted" } else { "no longer emitted" }
        );
    }
}
