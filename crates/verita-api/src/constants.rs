//! Route prefixes.

pub const API_PREFIX: &str = "/api/v0";

pub const WEBHOOK_PREFIX: &str = "/webhooks";
