//! The Agent-wide event type both the local daemon (external processes) and
//! in-process built-in Applications funnel through on their way to becoming
//! `DownstreamMessage`s, or, for `Preserve`, into the Instance's preserve set.

use std::collections::HashMap;

use ptb_apps::{AppEvent, LogLevel};

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Log { app: String, level: LogLevel, message: String },
    Data { app: String, measurement: String, tags: HashMap<String, String>, points: serde_json::Value },
    Preserve { app: String, path: String },
}

impl From<AppEvent> for AgentEvent {
    fn from(event: AppEvent) -> Self {
        match event {
            AppEvent::Log { app, level, message } => AgentEvent::Log { app, level, message },
            AppEvent::Data { app, measurement, tags, points } => AgentEvent::Data { app, measurement, tags, points },
            AppEvent::Preserve { app, path } => AgentEvent::Preserve { app, path },
        }
    }
}
