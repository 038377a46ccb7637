//! Subject - contextual fields merged into every payload
//!
//! Mirrors the collaborator the façade normally owns: a flat set of
//! string-keyed fields describing the user and device. An [`crate::EventSink`]
//! built with a subject fills these fields in on `add_event`, without
//! overriding anything the payload already carries.

use crate::constants::DEFAULT_PLATFORM;
use crate::payload::{Payload, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    settings: Payload,
}

impl Default for Subject {
    fn default() -> Self {
        Self::new()
    }
}

impl Subject {
    /// Create a subject with the default platform (`srv`)
    pub fn new() -> Self {
        Self {
            settings: Payload::new().with("p", DEFAULT_PLATFORM),
        }
    }

    pub fn set_platform(&mut self, platform: impl Into<String>) {
        self.settings.insert("p", platform.into());
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.settings.insert("uid", user_id.into());
    }

    pub fn set_screen_resolution(&mut self, width: u32, height: u32) {
        self.settings.insert("res", format!("{width}x{height}"));
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.settings.insert("vp", format!("{width}x{height}"));
    }

    pub fn set_color_depth(&mut self, depth: u32) {
        self.settings.insert("cd", depth);
    }

    pub fn set_timezone(&mut self, timezone: impl Into<String>) {
        self.settings.insert("tz", timezone.into());
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        self.settings.insert("lang", language.into());
    }

    pub fn set_ip_address(&mut self, ip: impl Into<String>) {
        self.settings.insert("ip", ip.into());
    }

    pub fn set_useragent(&mut self, useragent: impl Into<String>) {
        self.settings.insert("ua", useragent.into());
    }

    pub fn set_network_user_id(&mut self, id: impl Into<String>) {
        self.settings.insert("tnuid", id.into());
    }

    pub fn set_domain_user_id(&mut self, id: impl Into<String>) {
        self.settings.insert("duid", id.into());
    }

    pub fn set_referrer(&mut self, referrer: impl Into<String>) {
        self.settings.insert("refr", referrer.into());
    }

    pub fn set_page_url(&mut self, url: impl Into<String>) {
        self.settings.insert("url", url.into());
    }

    /// The current contextual fields
    pub fn settings(&self) -> &Payload {
        &self.settings
    }

    /// Fill in subject fields missing from `payload`
    pub fn merge_into(&self, payload: &mut Payload) {
        for (key, value) in self.settings.iter() {
            payload.insert_missing(key, value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_platform() {
        let subject = Subject::new();
        assert_eq!(subject.get("p"), Some(&Value::from("srv")));
        assert_eq!(subject.settings().len(), 1);
    }

    #[test]
    fn test_setters_use_protocol_keys() {
        let mut subject = Subject::new();
        subject.set_platform("mob");
        subject.set_user_id("user-42");
        subject.set_screen_resolution(1920, 1080);
        subject.set_viewport(800, 600);
        subject.set_color_depth(24);
        subject.set_timezone("Europe/London");
        subject.set_language("en");
        subject.set_ip_address("10.0.0.1");
        subject.set_useragent("curl/8");
        subject.set_network_user_id("n-1");
        subject.set_domain_user_id("d-1");
        subject.set_referrer("https://ref.example");
        subject.set_page_url("https://example.com");

        assert_eq!(subject.get("p"), Some(&Value::from("mob")));
        assert_eq!(subject.get("res"), Some(&Value::from("1920x1080")));
        assert_eq!(subject.get("vp"), Some(&Value::from("800x600")));
        assert_eq!(subject.get("cd"), Some(&Value::Integer(24)));
        assert_eq!(subject.get("tnuid"), Some(&Value::from("n-1")));
        assert_eq!(subject.settings().len(), 13);
    }

    #[test]
    fn test_merge_keeps_payload_fields() {
        let mut subject = Subject::new();
        subject.set_user_id("from-subject");

        let mut payload = Payload::new().with("e", "pv").with("uid", "from-event");
        subject.merge_into(&mut payload);

        assert_eq!(payload.get("uid"), Some(&Value::from("from-event")));
        assert_eq!(payload.get("p"), Some(&Value::from("srv")));
        assert_eq!(payload.len(), 3);
    }
}
