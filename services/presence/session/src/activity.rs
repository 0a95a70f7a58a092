//! Presence payload construction.
//!
//! The embedding application supplies a [`PresenceContext`] snapshot; this
//! module turns it into the `SET_ACTIVITY` command sent with opcode 1. Category
//! icon/label resolution happens before the context reaches us.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Command name for presence updates
pub const SET_ACTIVITY: &str = "SET_ACTIVITY";

/// Asset key of the application icon
pub const LARGE_IMAGE_KEY: &str = "app_icon";

/// Snapshot of what the user is doing, read once per update tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceContext {
    /// Resolved icon key for the current category
    #[serde(default)]
    pub category_icon: Option<String>,
    /// Resolved label for the current category
    #[serde(default)]
    pub category_text: Option<String>,
    /// Name of the current document
    pub display_name: String,
    /// Cursor line, zero or greater
    #[serde(default)]
    pub line_number: u32,
    /// Total lines, at least one
    #[serde(default = "default_line_count")]
    pub line_count: u32,
    /// Show document name and position instead of just the category
    #[serde(default)]
    pub detailed_display: bool,
}

fn default_line_count() -> u32 {
    1
}

impl Default for PresenceContext {
    fn default() -> Self {
        Self {
            category_icon: None,
            category_text: None,
            display_name: String::new(),
            line_number: 0,
            line_count: 1,
            detailed_display: false,
        }
    }
}

/// Last `(display_name, line_number)` pair that was sent
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LastKnownSnapshot {
    /// Document name at the last send
    pub display_name: String,
    /// Cursor line at the last send
    pub line_number: u32,
}

impl LastKnownSnapshot {
    /// Snapshot the fields that decide whether a send is needed
    pub fn of(context: &PresenceContext) -> Self {
        Self {
            display_name: context.display_name.clone(),
            line_number: context.line_number,
        }
    }

    /// Whether `context` would produce the same update
    pub fn matches(&self, context: &PresenceContext) -> bool {
        self.display_name == context.display_name && self.line_number == context.line_number
    }
}

/// Source of the current [`PresenceContext`]
pub trait ContextSource: Send + Sync {
    /// Read the current context
    fn current(&self) -> PresenceContext;
}

impl<F> ContextSource for F
where
    F: Fn() -> PresenceContext + Send + Sync,
{
    fn current(&self) -> PresenceContext {
        self()
    }
}

impl ContextSource for watch::Receiver<PresenceContext> {
    fn current(&self) -> PresenceContext {
        self.borrow().clone()
    }
}

/// Static strings baked into every payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityLabels {
    /// Host application name shown on the large image
    pub application_name: String,
    /// State shown when no category label is available
    pub fallback_state: String,
    /// Fixed `secrets.match` marker
    pub match_secret: String,
}

impl Default for ActivityLabels {
    fn default() -> Self {
        Self {
            application_name: "Editor".to_string(),
            fallback_state: "Unknown".to_string(),
            match_secret: "presence-ipc-match".to_string(),
        }
    }
}

/// `SET_ACTIVITY` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCommand {
    /// Always [`SET_ACTIVITY`]
    pub cmd: String,
    /// Command arguments
    pub args: ActivityArgs,
    /// Request nonce
    pub nonce: String,
}

/// Arguments of [`ActivityCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityArgs {
    /// Process id of this client
    pub pid: u32,
    /// Activity shown by the peer
    pub activity: Activity,
}

/// Activity block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// First line of text
    pub details: String,
    /// Second line of text
    pub state: String,
    /// Images and their hover text
    pub assets: Assets,
    /// Match marker
    pub secrets: Secrets,
}

/// Image assets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assets {
    /// Large image key
    pub large_image: String,
    /// Large image hover text
    pub large_text: String,
    /// Small image key, present together with `small_text`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    /// Small image hover text, present together with `small_image`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
}

/// Secrets block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    /// Static match marker
    #[serde(rename = "match")]
    pub match_secret: String,
}

/// Build the `SET_ACTIVITY` command for `context`
pub fn build(
    context: &PresenceContext,
    labels: &ActivityLabels,
    pid: u32,
    nonce: impl Into<String>,
) -> ActivityCommand {
    // A half-resolved category is treated as no category at all.
    let (small_image, small_text) = match (&context.category_icon, &context.category_text) {
        (Some(icon), Some(text)) => (Some(icon.clone()), Some(text.clone())),
        _ => (None, None),
    };

    let (details, state) = if context.detailed_display {
        (
            format!("Editing {}", context.display_name),
            format!(
                "Line {} ({} of {})",
                context.line_number, context.line_number, context.line_count
            ),
        )
    } else {
        (
            "Editing".to_string(),
            context
                .category_text
                .clone()
                .unwrap_or_else(|| labels.fallback_state.clone()),
        )
    };

    ActivityCommand {
        cmd: SET_ACTIVITY.to_string(),
        args: ActivityArgs {
            pid,
            activity: Activity {
                details,
                state,
                assets: Assets {
                    large_image: LARGE_IMAGE_KEY.to_string(),
                    large_text: labels.application_name.clone(),
                    small_image,
                    small_text,
                },
                secrets: Secrets {
                    match_secret: labels.match_secret.clone(),
                },
            },
        },
        nonce: nonce.into(),
    }
}

/// High-resolution timestamp used as the request nonce
pub fn now_nonce() -> String {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn rust_context() -> PresenceContext {
        PresenceContext {
            category_icon: Some("rust".to_string()),
            category_text: Some("Rust".to_string()),
            display_name: "main.rs".to_string(),
            line_number: 42,
            line_count: 120,
            detailed_display: true,
        }
    }

    fn to_value(command: &ActivityCommand) -> Value {
        serde_json::to_value(command).unwrap()
    }

    #[test]
    fn test_detailed_payload_shape() {
        let labels = ActivityLabels {
            application_name: "Scribe".to_string(),
            ..ActivityLabels::default()
        };
        let value = to_value(&build(&rust_context(), &labels, 4242, "nonce-1"));

        assert_eq!(value["cmd"], "SET_ACTIVITY");
        assert_eq!(value["nonce"], "nonce-1");
        assert_eq!(value["args"]["pid"], 4242);

        let activity = &value["args"]["activity"];
        assert_eq!(activity["details"], "Editing main.rs");
        assert_eq!(activity["state"], "Line 42 (42 of 120)");
        assert_eq!(activity["assets"]["large_image"], "app_icon");
        assert_eq!(activity["assets"]["large_text"], "Scribe");
        assert_eq!(activity["assets"]["small_image"], "rust");
        assert_eq!(activity["assets"]["small_text"], "Rust");
        assert_eq!(activity["secrets"]["match"], labels.match_secret.as_str());
    }

    #[test]
    fn test_summary_payload_without_icon() {
        let context = PresenceContext {
            category_icon: None,
            detailed_display: false,
            ..rust_context()
        };
        let value = to_value(&build(&context, &ActivityLabels::default(), 1, "n"));
        let activity = &value["args"]["activity"];
        let assets = activity["assets"].as_object().unwrap();

        assert!(!assets.contains_key("small_image"));
        assert!(!assets.contains_key("small_text"));
        assert_eq!(activity["details"], "Editing");
        assert_eq!(activity["state"], "Rust");
    }

    #[test]
    fn test_summary_payload_falls_back_without_category() {
        let context = PresenceContext {
            category_icon: Some("rust".to_string()),
            category_text: None,
            detailed_display: false,
            ..rust_context()
        };
        let labels = ActivityLabels::default();
        let value = to_value(&build(&context, &labels, 1, "n"));
        let activity = &value["args"]["activity"];

        assert_eq!(activity["state"], labels.fallback_state.as_str());
        assert!(activity["assets"].get("small_image").is_none());
        assert!(activity["assets"].get("small_text").is_none());
    }

    #[test]
    fn test_small_assets_all_or_nothing() {
        let labels = ActivityLabels::default();
        let options = [None, Some("x".to_string())];
        for icon in &options {
            for text in &options {
                for detailed in [false, true] {
                    let context = PresenceContext {
                        category_icon: icon.clone(),
                        category_text: text.clone(),
                        detailed_display: detailed,
                        ..rust_context()
                    };
                    let value = to_value(&build(&context, &labels, 1, "n"));
                    let assets = &value["args"]["activity"]["assets"];
                    assert_eq!(
                        assets.get("small_image").is_some(),
                        assets.get("small_text").is_some()
                    );
                }
            }
        }
    }

    #[test]
    fn test_snapshot_matching() {
        let context = rust_context();
        let snapshot = LastKnownSnapshot::of(&context);
        assert!(snapshot.matches(&context));

        let moved = PresenceContext {
            line_number: 43,
            ..context.clone()
        };
        assert!(!snapshot.matches(&moved));

        // Only name and line decide; the category does not.
        let recategorised = PresenceContext {
            category_text: None,
            ..context
        };
        assert!(snapshot.matches(&recategorised));
    }

    #[test]
    fn test_context_from_json_defaults() {
        let context: PresenceContext =
            serde_json::from_str(r#"{"display_name":"notes.txt"}"#).unwrap();
        assert_eq!(context.line_count, 1);
        assert_eq!(context.line_number, 0);
        assert!(!context.detailed_display);
        assert!(context.category_icon.is_none());
    }

    #[test]
    fn test_watch_context_source() {
        let (tx, rx) = watch::channel(PresenceContext::default());
        tx.send(rust_context()).unwrap();
        assert_eq!(rx.current().display_name, "main.rs");
    }
}
