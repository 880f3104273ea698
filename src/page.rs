use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::browser::{BrowserSession, Condition, Locator};
use crate::error::{BrowserError, ValidationError};

/// Where the swap service lives and how to find its controls.
///
/// No site is built in. Optional locators (busy indicators, progress,
/// rate-limit popup) may be left empty, which disables the matching check.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub url: String,
    /// Element whose presence means the page finished loading.
    pub ready: Locator,
    pub face_input: Locator,
    pub face_thumbnail: Locator,
    pub face_busy: Locator,
    pub source_input: Locator,
    pub source_thumbnail: Locator,
    pub source_busy: Locator,
    pub start_button: Locator,
    pub result_image: Locator,
    pub progress_container: Locator,
    pub progress_text: Locator,
    pub rate_limit_popup: Locator,
    pub rate_limit_dismiss: Locator,
}

impl SiteProfile {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.trim().is_empty() {
            return Err(ValidationError::IncompleteSite("site.url"));
        }

        let required = [
            ("site.ready", &self.ready),
            ("site.face_input", &self.face_input),
            ("site.face_thumbnail", &self.face_thumbnail),
            ("site.source_input", &self.source_input),
            ("site.source_thumbnail", &self.source_thumbnail),
            ("site.start_button", &self.start_button),
            ("site.result_image", &self.result_image),
        ];
        match required.iter().find(|(_, locator)| locator.is_empty()) {
            Some((name, _)) => Err(ValidationError::IncompleteSite(name)),
            None => Ok(()),
        }
    }
}

/// The two upload slots on the swap page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Face,
    Source,
}

/// Site-level queries over a raw browser session.
pub struct SwapPage<'a> {
    session: &'a mut dyn BrowserSession,
    site: &'a SiteProfile,
}

impl<'a> SwapPage<'a> {
    pub fn new(session: &'a mut dyn BrowserSession, site: &'a SiteProfile) -> Self {
        Self { session, site }
    }

    pub fn session(&mut self) -> &mut dyn BrowserSession {
        self.session
    }

    /// Navigate to the service unless the session is already there.
    pub fn go_home(&mut self) -> Result<(), BrowserError> {
        let current = self.session.current_url().unwrap_or_default();
        if !current.starts_with(&self.site.url) {
            self.session.navigate(&self.site.url)?;
        }
        Ok(())
    }

    pub fn is_ready(&mut self) -> bool {
        self.session.find(&self.site.ready).is_ok()
    }

    /// Poll for the ready marker.
    pub fn wait_ready(&mut self, timeout: Duration, poll: Duration) -> bool {
        let ready = Condition::Present(self.site.ready.clone());
        self.session.wait_until(&ready, timeout, poll)
    }

    /// Clear storage and cookies, then load the service page again.
    pub fn reset(&mut self) -> Result<(), BrowserError> {
        self.session.clear_state()?;
        self.session.navigate(&self.site.url)
    }

    pub fn upload(&mut self, slot: Slot, file: &Path) -> Result<(), BrowserError> {
        let input = match slot {
            Slot::Face => &self.site.face_input,
            Slot::Source => &self.site.source_input,
        };
        self.session.upload(input, file)
    }

    /// A thumbnail counts once its `src` is a blob or http URL.
    pub fn has_thumbnail(&mut self, slot: Slot) -> bool {
        let thumbnail = match slot {
            Slot::Face => &self.site.face_thumbnail,
            Slot::Source => &self.site.source_thumbnail,
        };
        match self.session.read_attribute(thumbnail, "src") {
            Ok(Some(src)) => src.starts_with("blob:") || src.starts_with("http"),
            _ => false,
        }
    }

    pub fn is_busy(&mut self, slot: Slot) -> bool {
        let busy = match slot {
            Slot::Face => &self.site.face_busy,
            Slot::Source => &self.site.source_busy,
        };
        !busy.is_empty() && self.session.is_displayed(busy).unwrap_or(false)
    }

    pub fn start_enabled(&mut self) -> Result<bool, BrowserError> {
        self.session.is_enabled(&self.site.start_button)
    }

    pub fn click_start(&mut self) -> Result<(), BrowserError> {
        self.session.click(&self.site.start_button)
    }

    /// Current result reference, if a result image with an http source is shown.
    pub fn result_ref(&mut self) -> Option<String> {
        if !self.session.is_displayed(&self.site.result_image).unwrap_or(false) {
            return None;
        }
        match self.session.read_attribute(&self.site.result_image, "src") {
            Ok(Some(src)) if src.starts_with("http") => Some(src),
            _ => None,
        }
    }

    pub fn progress_percent(&mut self) -> Option<u8> {
        if self.site.progress_container.is_empty() || self.site.progress_text.is_empty() {
            return None;
        }
        if !self.session.is_displayed(&self.site.progress_container).unwrap_or(false) {
            return None;
        }
        let text = self.session.read_text(&self.site.progress_text).ok()?;
        text.trim().trim_end_matches('%').trim().parse().ok()
    }

    pub fn rate_limited(&mut self) -> bool {
        !self.site.rate_limit_popup.is_empty()
            && self.session.is_displayed(&self.site.rate_limit_popup).unwrap_or(false)
    }

    pub fn dismiss_rate_limit(&mut self) -> Result<(), BrowserError> {
        if self.site.rate_limit_dismiss.is_empty() {
            return Ok(());
        }
        self.session.click(&self.site.rate_limit_dismiss)
    }
}
