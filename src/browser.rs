//! Browser automation capability consumed by the workers.
//!
//! Workers never talk to a concrete driver. They get a [`BrowserLauncher`]
//! shared across the run and open one exclusive [`BrowserSession`] each.

use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::BrowserError;

/// How to locate an element. Strings prefixed with `xpath:` are XPath
/// expressions, everything else (optionally prefixed `css:`) is a CSS selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn is_empty(&self) -> bool {
        match self {
            Locator::Css(value) | Locator::XPath(value) => value.trim().is_empty(),
        }
    }
}

impl From<String> for Locator {
    fn from(value: String) -> Self {
        if let Some(xpath) = value.strip_prefix("xpath:") {
            Locator::XPath(xpath.to_string())
        } else if let Some(css) = value.strip_prefix("css:") {
            Locator::Css(css.to_string())
        } else {
            Locator::Css(value)
        }
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Locator::from(value.to_string())
    }
}

impl Default for Locator {
    fn default() -> Self {
        Locator::Css(String::new())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(value) => write!(f, "css:{value}"),
            Locator::XPath(value) => write!(f, "xpath:{value}"),
        }
    }
}

/// Opaque handle to a located element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// Page conditions that [`BrowserSession::wait_until`] can poll for.
#[derive(Debug, Clone)]
pub enum Condition {
    Present(Locator),
    Displayed(Locator),
    Enabled(Locator),
}

pub trait BrowserSession: Send {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    fn current_url(&mut self) -> Result<String, BrowserError>;

    fn find(&mut self, locator: &Locator) -> Result<ElementRef, BrowserError>;

    /// `Ok(None)` when the element exists but has no such attribute.
    fn read_attribute(&mut self, locator: &Locator, name: &str) -> Result<Option<String>, BrowserError>;

    fn read_text(&mut self, locator: &Locator) -> Result<String, BrowserError>;

    fn is_displayed(&mut self, locator: &Locator) -> Result<bool, BrowserError>;

    fn is_enabled(&mut self, locator: &Locator) -> Result<bool, BrowserError>;

    /// Hand a local file path to a file input control.
    fn upload(&mut self, locator: &Locator, file: &Path) -> Result<(), BrowserError>;

    fn click(&mut self, locator: &Locator) -> Result<(), BrowserError>;

    /// Drop storage and cookies, then reload the current page.
    fn clear_state(&mut self) -> Result<(), BrowserError>;

    fn close(&mut self) -> Result<(), BrowserError>;

    fn check(&mut self, condition: &Condition) -> bool {
        match condition {
            Condition::Present(locator) => self.find(locator).is_ok(),
            Condition::Displayed(locator) => self.is_displayed(locator).unwrap_or(false),
            Condition::Enabled(locator) => self.is_enabled(locator).unwrap_or(false),
        }
    }

    /// Poll `condition` until it holds or `timeout` passes. Never errors on timeout.
    fn wait_until(&mut self, condition: &Condition, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check(condition) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(poll);
        }
    }
}

/// Opens fresh browser sessions. Shared by every worker of a run.
pub trait BrowserLauncher: Send + Sync {
    fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}
