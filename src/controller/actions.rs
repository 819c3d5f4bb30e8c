//! Built-in browser actions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use crate::actuator::WaitUntil;

use super::{
    ActionCategory, ActionContext, ActionHandler, ActionParams, ActionRegistry, ParamSpec,
    DONE_ACTION,
};

/// Register the default action catalogue on `registry`.
pub fn register_default_actions(registry: &ActionRegistry) {
    registry.register(
        "go_to_url",
        Arc::new(GoToUrl),
        ActionCategory::Navigation,
        "Navigate to a specific URL",
        None,
    );
    registry.register(
        "click_element",
        Arc::new(ClickElement),
        ActionCategory::Interaction,
        "Click on an element matching the selector",
        None,
    );
    registry.register(
        "input_text",
        Arc::new(InputText),
        ActionCategory::Interaction,
        "Type text into an element matching the selector",
        None,
    );
    registry.register(
        "get_dom",
        Arc::new(GetDom),
        ActionCategory::Extraction,
        "Get the HTML content of the current page",
        None,
    );
    registry.register(
        "capture_screenshot",
        Arc::new(CaptureScreenshot),
        ActionCategory::Extraction,
        "Capture a screenshot of the current page",
        None,
    );
    registry.register(
        "wait",
        Arc::new(Wait),
        ActionCategory::Utility,
        "Wait for the given number of milliseconds",
        None,
    );
    registry.register(
        DONE_ACTION,
        Arc::new(Done),
        ActionCategory::System,
        "Signal that the task is complete",
        None,
    );
}

fn str_param<'a>(params: &'a ActionParams, name: &str) -> anyhow::Result<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Parameter '{}' must be a string", name))
}

fn millis_param(params: &ActionParams, name: &str) -> anyhow::Result<Option<Duration>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| anyhow!("Parameter '{}' must be a non-negative integer", name)),
    }
}

fn encode_png(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

async fn screenshot_b64(ctx: &ActionContext<'_>, full_page: bool) -> anyhow::Result<String> {
    let bytes = ctx.actuator.capture_screenshot(full_page).await?;
    Ok(encode_png(&bytes))
}

struct GoToUrl;

#[async_trait]
impl ActionHandler for GoToUrl {
    fn params(&self) -> ParamSpec {
        ParamSpec::new()
            .required("url")
            .optional("wait_until", "networkidle")
            .optional("timeout", Value::Null)
    }

    async fn call(&self, ctx: &ActionContext<'_>, params: ActionParams) -> anyhow::Result<Value> {
        let raw = str_param(&params, "url")?;
        let url = url::Url::parse(raw).with_context(|| format!("Invalid URL '{}'", raw))?;
        let timeout = millis_param(&params, "timeout")?.unwrap_or(ctx.browser.navigation_timeout);
        let wait_until = match params.get("wait_until").and_then(Value::as_str) {
            Some(raw) => raw.parse::<WaitUntil>()?,
            None => WaitUntil::default(),
        };

        let content = ctx
            .actuator
            .navigate(url.as_str(), wait_until, timeout)
            .await?;
        let page_state = ctx.actuator.page_state().await?;
        let screenshot = screenshot_b64(ctx, false).await?;

        Ok(json!({
            "url": page_state.url,
            "title": page_state.title,
            "content_length": content.len(),
            "page_state": page_state,
            "screenshot": screenshot,
        }))
    }
}

struct ClickElement;

#[async_trait]
impl ActionHandler for ClickElement {
    fn params(&self) -> ParamSpec {
        ParamSpec::new().required("selector").optional("timeout", 10_000)
    }

    async fn call(&self, ctx: &ActionContext<'_>, params: ActionParams) -> anyhow::Result<Value> {
        let selector = str_param(&params, "selector")?;
        let timeout = millis_param(&params, "timeout")?.unwrap_or(ctx.browser.default_timeout);

        ctx.actuator.click(selector, timeout).await?;
        let page_state = ctx.actuator.page_state().await?;
        let screenshot = screenshot_b64(ctx, false).await?;

        Ok(json!({
            "selector": selector,
            "page_state": page_state,
            "screenshot": screenshot,
        }))
    }
}

struct InputText;

#[async_trait]
impl ActionHandler for InputText {
    fn params(&self) -> ParamSpec {
        ParamSpec::new()
            .required("selector")
            .required("text")
            .optional("delay", 50)
    }

    async fn call(&self, ctx: &ActionContext<'_>, params: ActionParams) -> anyhow::Result<Value> {
        let selector = str_param(&params, "selector")?;
        let text = str_param(&params, "text")?;
        let delay = millis_param(&params, "delay")?.unwrap_or_default();

        ctx.actuator.type_text(selector, text, delay).await?;
        let screenshot = screenshot_b64(ctx, false).await?;

        Ok(json!({
            "selector": selector,
            "text_length": text.chars().count(),
            "screenshot": screenshot,
        }))
    }
}

struct GetDom;

#[async_trait]
impl ActionHandler for GetDom {
    async fn call(&self, ctx: &ActionContext<'_>, _params: ActionParams) -> anyhow::Result<Value> {
        let content = ctx.actuator.content().await?;
        let page_state = ctx.actuator.page_state().await?;
        Ok(json!({
            "content": content,
            "page_state": page_state,
        }))
    }
}

struct CaptureScreenshot;

#[async_trait]
impl ActionHandler for CaptureScreenshot {
    fn params(&self) -> ParamSpec {
        ParamSpec::new().optional("full_page", true)
    }

    async fn call(&self, ctx: &ActionContext<'_>, params: ActionParams) -> anyhow::Result<Value> {
        let full_page = params
            .get("full_page")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let screenshot = screenshot_b64(ctx, full_page).await?;
        Ok(json!({
            "screenshot": screenshot,
            "full_page": full_page,
        }))
    }
}

struct Wait;

#[async_trait]
impl ActionHandler for Wait {
    fn params(&self) -> ParamSpec {
        ParamSpec::new().required("time")
    }

    async fn call(&self, ctx: &ActionContext<'_>, params: ActionParams) -> anyhow::Result<Value> {
        let duration = millis_param(&params, "time")?.unwrap_or_default();
        ctx.actuator.wait(duration).await?;
        Ok(json!({ "waited_ms": duration.as_millis() as u64 }))
    }
}

struct Done;

#[async_trait]
impl ActionHandler for Done {
    async fn call(&self, _ctx: &ActionContext<'_>, _params: ActionParams) -> anyhow::Result<Value> {
        Ok(json!({ "done": true }))
    }
}
