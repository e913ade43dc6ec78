use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Hosting platform of a node or coordinator; selects the resource loader
/// and KMS backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlatformType {
    Local,
    Aws,
    Azure,
    Ibm,
    Google,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl PlatformType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::Local => "LOCAL",
            PlatformType::Aws => "AWS",
            PlatformType::Azure => "AZURE",
            PlatformType::Ibm => "IBM",
            PlatformType::Google => "GOOGLE",
        }
    }
}

impl FromStr for PlatformType {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(PlatformType::Local),
            "AWS" => Ok(PlatformType::Aws),
            "AZURE" => Ok(PlatformType::Azure),
            "IBM" => Ok(PlatformType::Ibm),
            "GOOGLE" => Ok(PlatformType::Google),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
