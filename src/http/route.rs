//! REST routes
//!
//! A route is a path template plus the identifiers substituted into it. The
//! identifiers double as the rate-limit discriminator until the server has
//! told us which bucket the route belongs to.

use crate::ratelimit::Discriminator;

/// A REST path with its bucket-affinity identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    template: String,
    path: String,
    channel_id: Option<String>,
    guild_id: Option<String>,
    webhook_id: Option<String>,
    webhook_token: Option<String>,
}

impl Route {
    /// Route for `template`, e.g. `/channels/{channel_id}/messages`
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        Self {
            path: template.clone(),
            template,
            channel_id: None,
            guild_id: None,
            webhook_id: None,
            webhook_token: None,
        }
    }

    pub fn channel(mut self, channel_id: impl ToString) -> Self {
        let id = channel_id.to_string();
        self = self.param("channel_id", &id);
        self.channel_id = Some(id);
        self
    }

    pub fn guild(mut self, guild_id: impl ToString) -> Self {
        let id = guild_id.to_string();
        self = self.param("guild_id", &id);
        self.guild_id = Some(id);
        self
    }

    pub fn webhook(mut self, webhook_id: impl ToString, token: Option<&str>) -> Self {
        let id = webhook_id.to_string();
        self = self.param("webhook_id", &id);
        if let Some(token) = token {
            self = self.param("webhook_token", token);
            self.webhook_token = Some(token.to_string());
        }
        self.webhook_id = Some(id);
        self
    }

    /// Substitute a non-major `{name}` placeholder
    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.path = self.path.replace(&format!("{{{name}}}"), value);
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full URL under `base`, which already carries the API version
    pub fn url(&self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.path)
    }

    pub fn discriminator(&self) -> Discriminator {
        Discriminator {
            route: self.template.clone(),
            path: self.path.clone(),
            channel_id: self.channel_id.clone(),
            guild_id: self.guild_id.clone(),
            webhook_id: self.webhook_id.clone(),
            webhook_token: self.webhook_token.clone(),
        }
    }
}
