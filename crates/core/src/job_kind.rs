//! Categories of background work.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A category of background work. Each kind owns exactly one queue, named
/// after [`JobKind::as_str`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    DeleteImage,
    RemoveBackground,
    FlipImage,
    EditImage,
    GenerateImage,
    ExportPdf,
    ExportPng,
    DeleteRoom,
}

/// Returned when a job kind name does not match any known kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown job kind: {0}")]
pub struct ParseJobKindError(pub String);

impl JobKind {
    pub const ALL: [JobKind; 8] = [
        JobKind::DeleteImage,
        JobKind::RemoveBackground,
        JobKind::FlipImage,
        JobKind::EditImage,
        JobKind::GenerateImage,
        JobKind::ExportPdf,
        JobKind::ExportPng,
        JobKind::DeleteRoom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DeleteImage => "delete-image",
            JobKind::RemoveBackground => "remove-background",
            JobKind::FlipImage => "flip-image",
            JobKind::EditImage => "edit-image",
            JobKind::GenerateImage => "generate-image",
            JobKind::ExportPdf => "export-pdf",
            JobKind::ExportPng => "export-png",
            JobKind::DeleteRoom => "delete-room",
        }
    }

    /// Name of the durable queue backing this kind.
    pub fn queue_name(&self) -> &'static str {
        self.as_str()
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ParseJobKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseJobKindError(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_parses_from_its_name() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
    }

    #[test]
    fn serde_name_matches_queue_name() {
        let json = serde_json::to_string(&JobKind::RemoveBackground).unwrap();
        assert_eq!(json, format!("\"{}\"", JobKind::RemoveBackground.queue_name()));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = "resize-video".parse::<JobKind>().unwrap_err();
        assert_eq!(err, ParseJobKindError("resize-video".into()));
    }
}
