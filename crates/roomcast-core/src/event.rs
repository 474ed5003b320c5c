//! Event name taxonomy.
//!
//! The platform identifies push events by a `category:subject` string,
//! e.g. `"device:offline"` or `"pms:guest-checkin"`. This module maps
//! the known names onto [`EventKind`] so consumers can match on an enum
//! instead of string-compare, while unknown names stay routable through
//! the `Other` variant.

use std::fmt;

/// Well-known event names.
pub mod names {
    pub const DEVICE_REGISTERED: &str = "device:registered";
    pub const DEVICE_APPROVED: &str = "device:approved";
    pub const DEVICE_REJECTED: &str = "device:rejected";
    pub const DEVICE_STATUS_ALERT: &str = "device:status-alert";
    pub const DEVICE_OFFLINE: &str = "device:offline";
    pub const DEVICE_HEARTBEAT: &str = "device:heartbeat";
    pub const DEVICE_CONFIG_UPDATED: &str = "device:config-updated";
    pub const DEVICE_INSTALL_RESULT: &str = "device:install-result";

    pub const PMS_SYNC_STARTED: &str = "pms:sync-started";
    pub const PMS_SYNC_COMPLETED: &str = "pms:sync-completed";
    pub const PMS_SYNC_FAILED: &str = "pms:sync-failed";
    pub const PMS_GUEST_CHECKIN: &str = "pms:guest-checkin";
    pub const PMS_GUEST_CHECKOUT: &str = "pms:guest-checkout";

    pub const SETTING_UPDATED: &str = "setting:updated";
    pub const USER_LOGGED_OUT: &str = "user:logged-out";
    pub const SYSTEM_ALERT: &str = "system:alert";
}

/// Broad grouping used for filtering in UI consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Device,
    Content,
    Pms,
    Setting,
    System,
    Unknown,
}

/// A decoded event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    DeviceRegistered,
    DeviceApproved,
    DeviceRejected,
    DeviceStatusAlert,
    DeviceOffline,
    DeviceHeartbeat,
    DeviceConfigUpdated,
    DeviceInstallResult,

    /// App lifecycle events, keyed by subject (`"app:<subject>"`).
    App(String),
    /// Background/screensaver content events (`"background:<subject>"`).
    Background(String),

    PmsSyncStarted,
    PmsSyncCompleted,
    PmsSyncFailed,
    PmsGuestCheckin,
    PmsGuestCheckout,

    SettingUpdated,
    UserLoggedOut,
    SystemAlert,

    /// Any name this client does not know about. Kept verbatim so
    /// handlers registered on the raw string still fire.
    Other(String),
}

impl EventKind {
    /// Decode a wire event name. Never fails; unknown names become
    /// [`EventKind::Other`].
    pub fn parse(name: &str) -> Self {
        match name {
            names::DEVICE_REGISTERED => Self::DeviceRegistered,
            names::DEVICE_APPROVED => Self::DeviceApproved,
            names::DEVICE_REJECTED => Self::DeviceRejected,
            names::DEVICE_STATUS_ALERT => Self::DeviceStatusAlert,
            names::DEVICE_OFFLINE => Self::DeviceOffline,
            names::DEVICE_HEARTBEAT => Self::DeviceHeartbeat,
            names::DEVICE_CONFIG_UPDATED => Self::DeviceConfigUpdated,
            names::DEVICE_INSTALL_RESULT => Self::DeviceInstallResult,
            names::PMS_SYNC_STARTED => Self::PmsSyncStarted,
            names::PMS_SYNC_COMPLETED => Self::PmsSyncCompleted,
            names::PMS_SYNC_FAILED => Self::PmsSyncFailed,
            names::PMS_GUEST_CHECKIN => Self::PmsGuestCheckin,
            names::PMS_GUEST_CHECKOUT => Self::PmsGuestCheckout,
            names::SETTING_UPDATED => Self::SettingUpdated,
            names::USER_LOGGED_OUT => Self::UserLoggedOut,
            names::SYSTEM_ALERT => Self::SystemAlert,
            other => {
                if let Some(subject) = other.strip_prefix("app:") {
                    Self::App(subject.to_owned())
                } else if let Some(subject) = other.strip_prefix("background:") {
                    Self::Background(subject.to_owned())
                } else {
                    Self::Other(other.to_owned())
                }
            }
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Self::DeviceRegistered
            | Self::DeviceApproved
            | Self::DeviceRejected
            | Self::DeviceStatusAlert
            | Self::DeviceOffline
            | Self::DeviceHeartbeat
            | Self::DeviceConfigUpdated
            | Self::DeviceInstallResult => EventCategory::Device,
            Self::App(_) | Self::Background(_) => EventCategory::Content,
            Self::PmsSyncStarted
            | Self::PmsSyncCompleted
            | Self::PmsSyncFailed
            | Self::PmsGuestCheckin
            | Self::PmsGuestCheckout => EventCategory::Pms,
            Self::SettingUpdated => EventCategory::Setting,
            Self::UserLoggedOut | Self::SystemAlert => EventCategory::System,
            Self::Other(_) => EventCategory::Unknown,
        }
    }

    /// The wire name this kind round-trips to.
    pub fn as_wire_name(&self) -> String {
        match self {
            Self::DeviceRegistered => names::DEVICE_REGISTERED.to_owned(),
            Self::DeviceApproved => names::DEVICE_APPROVED.to_owned(),
            Self::DeviceRejected => names::DEVICE_REJECTED.to_owned(),
            Self::DeviceStatusAlert => names::DEVICE_STATUS_ALERT.to_owned(),
            Self::DeviceOffline => names::DEVICE_OFFLINE.to_owned(),
            Self::DeviceHeartbeat => names::DEVICE_HEARTBEAT.to_owned(),
            Self::DeviceConfigUpdated => names::DEVICE_CONFIG_UPDATED.to_owned(),
            Self::DeviceInstallResult => names::DEVICE_INSTALL_RESULT.to_owned(),
            Self::App(subject) => format!("app:{subject}"),
            Self::Background(subject) => format!("background:{subject}"),
            Self::PmsSyncStarted => names::PMS_SYNC_STARTED.to_owned(),
            Self::PmsSyncCompleted => names::PMS_SYNC_COMPLETED.to_owned(),
            Self::PmsSyncFailed => names::PMS_SYNC_FAILED.to_owned(),
            Self::PmsGuestCheckin => names::PMS_GUEST_CHECKIN.to_owned(),
            Self::PmsGuestCheckout => names::PMS_GUEST_CHECKOUT.to_owned(),
            Self::SettingUpdated => names::SETTING_UPDATED.to_owned(),
            Self::UserLoggedOut => names::USER_LOGGED_OUT.to_owned(),
            Self::SystemAlert => names::SYSTEM_ALERT.to_owned(),
            Self::Other(name) => name.clone(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire_name())
    }
}
