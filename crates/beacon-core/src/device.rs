use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Placeholder id used while the real identity is not yet known.
pub const TEMPORARY_DEVICE_ID: &str = "CLYTemporaryDeviceID";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceIdMode {
    DeveloperSupplied,
    Generated,
    Temporary,
}

impl DeviceIdMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeveloperSupplied => "developer_supplied",
            Self::Generated => "generated",
            Self::Temporary => "temporary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "developer_supplied" => Some(Self::DeveloperSupplied),
            "generated" => Some(Self::Generated),
            "temporary" => Some(Self::Temporary),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub mode: DeviceIdMode,
}

impl DeviceIdentity {
    pub fn developer(id: impl Into<String>) -> Self {
        Self { id: id.into(), mode: DeviceIdMode::DeveloperSupplied }
    }

    pub fn generated() -> Self {
        Self { id: Uuid::now_v7().to_string(), mode: DeviceIdMode::Generated }
    }

    pub fn temporary() -> Self {
        Self { id: TEMPORARY_DEVICE_ID.to_owned(), mode: DeviceIdMode::Temporary }
    }

    pub fn is_temporary(&self) -> bool {
        self.mode == DeviceIdMode::Temporary
    }
}
