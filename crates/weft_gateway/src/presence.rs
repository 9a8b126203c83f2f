//! Presence payload construction.
//!
//! Activities are validated as they are built so an invalid payload is an
//! error at the call site, never a silently-dropped frame on the wire.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Longest accepted activity name, state, and details.
pub const TEXT_MAX: usize = 128;
/// Longest accepted URL.
pub const URL_MAX: usize = 512;
/// Longest accepted button label.
pub const BUTTON_LABEL_MAX: usize = 32;
/// Most buttons one activity may carry.
pub const BUTTONS_MAX: usize = 2;

/// Why a presence payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// The activity name was empty.
    EmptyName,
    /// A text field exceeded its limit.
    TooLong {
        /// Which field.
        field: &'static str,
        /// Its limit.
        max: usize,
    },
    /// More than [`BUTTONS_MAX`] buttons.
    TooManyButtons(usize),
}

impl fmt::Display for PresenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceError::EmptyName => write!(f, "activity name must not be empty"),
            PresenceError::TooLong { field, max } => {
                write!(f, "{} exceeds {} characters", field, max)
            }
            PresenceError::TooManyButtons(n) => {
                write!(f, "{} buttons exceeds the limit of {}", n, BUTTONS_MAX)
            }
        }
    }
}

impl std::error::Error for PresenceError {}

/// What kind of activity is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    /// "Playing …"
    Playing,
    /// "Streaming …" (requires a URL).
    Streaming,
    /// "Listening to …"
    Listening,
    /// "Watching …"
    Watching,
    /// Custom status text.
    Custom,
    /// "Competing in …"
    Competing,
}

impl ActivityKind {
    fn as_u8(self) -> u8 {
        match self {
            ActivityKind::Playing => 0,
            ActivityKind::Streaming => 1,
            ActivityKind::Listening => 2,
            ActivityKind::Watching => 3,
            ActivityKind::Custom => 4,
            ActivityKind::Competing => 5,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ActivityKind::Playing),
            1 => Some(ActivityKind::Streaming),
            2 => Some(ActivityKind::Listening),
            3 => Some(ActivityKind::Watching),
            4 => Some(ActivityKind::Custom),
            5 => Some(ActivityKind::Competing),
            _ => None,
        }
    }
}

impl Serialize for ActivityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for ActivityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        ActivityKind::from_u8(v)
            .ok_or_else(|| de::Error::custom(format!("unknown activity type {}", v)))
    }
}

/// A button shown under an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityButton {
    /// Button text.
    pub label: String,
    /// Target URL.
    pub url: String,
}

/// One validated activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Display name.
    pub name: String,
    /// Activity type.
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// Stream URL, for [`ActivityKind::Streaming`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// User-facing state line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// User-facing details line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Up to [`BUTTONS_MAX`] buttons.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub buttons: Vec<ActivityButton>,
}

impl Activity {
    /// Start building an activity.
    pub fn builder(name: impl Into<String>, kind: ActivityKind) -> ActivityBuilder {
        ActivityBuilder {
            name: name.into(),
            kind,
            url: None,
            state: None,
            details: None,
            buttons: Vec::new(),
        }
    }
}

/// Builder applying the payload limits.
#[derive(Debug, Clone)]
pub struct ActivityBuilder {
    name: String,
    kind: ActivityKind,
    url: Option<String>,
    state: Option<String>,
    details: Option<String>,
    buttons: Vec<ActivityButton>,
}

impl ActivityBuilder {
    /// Stream URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// State line.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Details line.
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Add a button.
    pub fn button(mut self, label: impl Into<String>, url: impl Into<String>) -> Self {
        self.buttons.push(ActivityButton {
            label: label.into(),
            url: url.into(),
        });
        self
    }

    /// Validate and produce the activity.
    pub fn build(self) -> Result<Activity, PresenceError> {
        if self.name.is_empty() {
            return Err(PresenceError::EmptyName);
        }
        if self.name.chars().count() > TEXT_MAX {
            return Err(PresenceError::TooLong {
                field: "name",
                max: TEXT_MAX,
            });
        }
        for (field, value) in [("state", &self.state), ("details", &self.details)] {
            if let Some(v) = value {
                if v.chars().count() > TEXT_MAX {
                    return Err(PresenceError::TooLong {
                        field,
                        max: TEXT_MAX,
                    });
                }
            }
        }
        if let Some(url) = &self.url {
            if url.chars().count() > URL_MAX {
                return Err(PresenceError::TooLong {
                    field: "url",
                    max: URL_MAX,
                });
            }
        }
        if self.buttons.len() > BUTTONS_MAX {
            return Err(PresenceError::TooManyButtons(self.buttons.len()));
        }
        for button in &self.buttons {
            if button.label.chars().count() > BUTTON_LABEL_MAX {
                return Err(PresenceError::TooLong {
                    field: "button label",
                    max: BUTTON_LABEL_MAX,
                });
            }
            if button.url.chars().count() > URL_MAX {
                return Err(PresenceError::TooLong {
                    field: "button url",
                    max: URL_MAX,
                });
            }
        }
        Ok(Activity {
            name: self.name,
            kind: self.kind,
            url: self.url,
            state: self.state,
            details: self.details,
            buttons: self.buttons,
        })
    }
}

/// Online status shown alongside activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    /// Green dot.
    Online,
    /// Do not disturb.
    Dnd,
    /// Away.
    Idle,
    /// Appears offline.
    Invisible,
    /// Offline.
    Offline,
}

/// A full presence update payload (op 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// When the client went idle, ms since the epoch.
    pub since: Option<u64>,
    /// Activities to display.
    pub activities: Vec<Activity>,
    /// Online status.
    pub status: OnlineStatus,
    /// Whether the client is AFK.
    pub afk: bool,
}

impl PresenceUpdate {
    /// An online presence with the given activities.
    pub fn online(activities: Vec<Activity>) -> Self {
        Self {
            since: None,
            activities,
            status: OnlineStatus::Online,
            afk: false,
        }
    }
}
