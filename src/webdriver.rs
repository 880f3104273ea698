//! W3C WebDriver backend for [`BrowserSession`], talking to a running
//! chromedriver (or any compatible endpoint) over HTTP.

use reqwest::Method;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;

use crate::browser::{BrowserLauncher, BrowserSession, ElementRef, Locator};
use crate::error::BrowserError;

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

pub struct WebDriverLauncher {
    endpoint: String,
    headless: bool,
    args: Vec<String>,
    client: Client,
}

impl WebDriverLauncher {
    pub fn new(endpoint: &str, headless: bool, args: Vec<String>) -> Result<Self, BrowserError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BrowserError::Launch(format!("failed to initialize HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            headless,
            args,
            client,
        })
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
            args.push("--disable-gpu".to_string());
        }
        args.extend(self.args.iter().cloned());

        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": args,
                        "excludeSwitches": ["enable-logging"],
                    }
                }
            }
        })
    }
}

impl BrowserLauncher for WebDriverLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let value = send(
            &self.client,
            Method::POST,
            &format!("{}/session", self.endpoint),
            Some(self.capabilities()),
        )
        .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Launch("response did not contain a session id".into()))?;

        log::debug!("WebDriver session {session_id} created at {}", self.endpoint);
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{session_id}", self.endpoint),
            closed: false,
        }))
    }
}

pub struct WebDriverSession {
    client: Client,
    base: String,
    closed: bool,
}

impl WebDriverSession {
    fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, BrowserError> {
        send(&self.client, method, &format!("{}{path}", self.base), body)
    }

    fn element(&self, locator: &Locator) -> Result<String, BrowserError> {
        let (using, value) = match locator {
            Locator::Css(value) => ("css selector", value),
            Locator::XPath(value) => ("xpath", value),
        };
        let found = self
            .call(Method::POST, "/element", Some(json!({ "using": using, "value": value })))
            .map_err(|e| match e {
                BrowserError::NotFound(_) => BrowserError::NotFound(locator.to_string()),
                other => other,
            })?;
        found
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Transient(format!("malformed element reference for {locator}")))
    }

    fn element_call(&self, locator: &Locator, method: Method, suffix: &str, body: Option<Value>) -> Result<Value, BrowserError> {
        let id = self.element(locator)?;
        self.call(method, &format!("/element/{id}{suffix}"), body)
    }
}

impl BrowserSession for WebDriverSession {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.call(Method::POST, "/url", Some(json!({ "url": url })))
            .map(drop)
            .map_err(|e| match e {
                BrowserError::Fatal(_) => e,
                other => BrowserError::Navigation(other.to_string()),
            })
    }

    fn current_url(&mut self) -> Result<String, BrowserError> {
        let value = self.call(Method::GET, "/url", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn find(&mut self, locator: &Locator) -> Result<ElementRef, BrowserError> {
        self.element(locator).map(ElementRef)
    }

    fn read_attribute(&mut self, locator: &Locator, name: &str) -> Result<Option<String>, BrowserError> {
        let value = self.element_call(locator, Method::GET, &format!("/attribute/{name}"), None)?;
        Ok(value.as_str().map(str::to_string))
    }

    fn read_text(&mut self, locator: &Locator) -> Result<String, BrowserError> {
        let value = self.element_call(locator, Method::GET, "/text", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn is_displayed(&mut self, locator: &Locator) -> Result<bool, BrowserError> {
        let value = self.element_call(locator, Method::GET, "/displayed", None)?;
        Ok(value.as_bool().unwrap_or(false))
    }

    fn is_enabled(&mut self, locator: &Locator) -> Result<bool, BrowserError> {
        let value = self.element_call(locator, Method::GET, "/enabled", None)?;
        Ok(value.as_bool().unwrap_or(false))
    }

    fn upload(&mut self, locator: &Locator, file: &Path) -> Result<(), BrowserError> {
        let path = file
            .canonicalize()
            .map_err(|e| BrowserError::Transient(format!("cannot resolve {}: {e}", file.display())))?;
        let text = path.to_string_lossy();
        self.element_call(locator, Method::POST, "/value", Some(json!({ "text": text })))
            .map(drop)
    }

    fn click(&mut self, locator: &Locator) -> Result<(), BrowserError> {
        self.element_call(locator, Method::POST, "/click", Some(json!({})))
            .map(drop)
    }

    fn clear_state(&mut self) -> Result<(), BrowserError> {
        self.call(
            Method::POST,
            "/execute/sync",
            Some(json!({
                "script": "window.localStorage.clear(); window.sessionStorage.clear();",
                "args": [],
            })),
        )?;
        self.call(Method::DELETE, "/cookie", None)?;
        self.call(Method::POST, "/refresh", Some(json!({})))
            .map(drop)
    }

    fn close(&mut self) -> Result<(), BrowserError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.call(Method::DELETE, "", None).map(drop)
    }
}

fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value, BrowserError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().map_err(|e| {
        if e.is_timeout() {
            BrowserError::Transient(format!("request timed out: {url}"))
        } else if e.is_connect() {
            BrowserError::Fatal(format!("cannot reach WebDriver at {url}: {e}"))
        } else {
            BrowserError::Transient(format!("request failed: {url}: {e}"))
        }
    })?;

    let status = response.status();
    let payload: Value = response
        .json()
        .map_err(|e| BrowserError::Transient(format!("invalid WebDriver response from {url}: {e}")))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    Err(classify(code, message))
}

/// Map a W3C error code onto the retry taxonomy.
fn classify(code: &str, message: &str) -> BrowserError {
    let detail = if message.is_empty() {
        code.to_string()
    } else {
        format!("{code}: {message}")
    };
    match code {
        "no such element" | "stale element reference" => BrowserError::NotFound(detail),
        "invalid session id" | "session not created" | "no such window" => BrowserError::Fatal(detail),
        _ => BrowserError::Transient(detail),
    }
}
