use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::csp::CspConfiguration;
use crate::window::ConsoleLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentStatus {
    Initializing,
    InstallingPackages,
    RunningCode,
}

/// Lifecycle event streamed back from `runWidgetCode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HtmlRunEvent {
    EnvironmentStatus {
        status: EnvironmentStatus,
    },
    #[serde(rename_all = "camelCase")]
    RunComplete {
        was_cancelled: bool,
        was_fatal_error: bool,
    },
    Error {
        message: String,
        #[serde(default)]
        stack: Option<String>,
        #[serde(default)]
        line: Option<u32>,
        #[serde(default)]
        column: Option<u32>,
        #[serde(default)]
        source: Option<String>,
    },
    Log {
        level: ConsoleLevel,
        message: String,
    },
}

impl HtmlRunEvent {
    pub fn status(status: EnvironmentStatus) -> Self {
        Self::EnvironmentStatus { status }
    }

    pub fn cancelled() -> Self {
        Self::RunComplete {
            was_cancelled: true,
            was_fatal_error: false,
        }
    }

    pub fn fatal() -> Self {
        Self::RunComplete {
            was_cancelled: false,
            was_fatal_error: true,
        }
    }

    pub fn finished() -> Self {
        Self::RunComplete {
            was_cancelled: false,
            was_fatal_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            stack: None,
            line: None,
            column: None,
            source: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunComplete { .. })
    }
}

/// What the widget registration layer hands to `runWidgetCode`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WidgetRunParams {
    pub html: String,
    pub widget_id: Option<String>,
    pub widget_state: JsonValue,
    pub tool_input: JsonValue,
    pub tool_output: JsonValue,
    pub tool_response_metadata: JsonValue,
    pub theme: Option<String>,
    pub safe_area: JsonValue,
    pub max_height: Option<f64>,
    pub user_agent: JsonValue,
    pub locale: Option<String>,
    pub display_mode: Option<String>,
    pub csp: Option<CspConfiguration>,
    pub additional_globals: BTreeMap<String, JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_use_tagged_wire_shape() {
        let value = serde_json::to_value(HtmlRunEvent::fatal()).unwrap();
        assert_eq!(
            value,
            json!({"type": "RUN_COMPLETE", "wasCancelled": false, "wasFatalError": true})
        );
        let value = serde_json::to_value(HtmlRunEvent::status(EnvironmentStatus::RunningCode)).unwrap();
        assert_eq!(value, json!({"type": "ENVIRONMENT_STATUS", "status": "RUNNING_CODE"}));

        let log: HtmlRunEvent =
            serde_json::from_value(json!({"type": "LOG", "level": "warn", "message": "careful"})).unwrap();
        assert_eq!(
            log,
            HtmlRunEvent::Log {
                level: ConsoleLevel::Warn,
                message: "careful".into()
            }
        );
    }

    #[test]
    fn params_read_camel_case() {
        let params: WidgetRunParams = serde_json::from_value(json!({
            "html": "<p>hi</p>",
            "widgetId": "w-1",
            "toolInput": {"q": 1},
            "maxHeight": 480,
            "csp": {"resourceDomains": ["a.com"]},
            "additionalGlobals": {"flags": [1, 2]}
        }))
        .unwrap();
        assert_eq!(params.widget_id.as_deref(), Some("w-1"));
        assert_eq!(params.tool_input, json!({"q": 1}));
        assert_eq!(params.max_height, Some(480.0));
        assert_eq!(params.csp.unwrap().resource_domains, vec!["a.com"]);
        assert_eq!(params.additional_globals["flags"], json!([1, 2]));
        assert_eq!(params.tool_output, JsonValue::Null);
    }
}
