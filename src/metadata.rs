use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Metadata carried with every TUS upload through the `Upload-Metadata`
/// header and persisted in the staging sidecar.
///
/// Numeric fields (`part_index`, `total_parts`, `original_file_size`) stay
/// stringly typed here because that is how the protocol transports them;
/// accessors parse on demand.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_duplicate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multipart_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_parts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_file_size: Option<String>,
}

impl UploadMetadata {
    /// Parses an `Upload-Metadata` header value.
    ///
    /// Pairs are comma-separated; within a pair a space separates the key
    /// from the base64-encoded value. Empty, malformed, and unknown pairs
    /// are silently dropped.
    #[must_use]
    pub fn parse_header(raw: &str) -> Self {
        let mut metadata = Self::default();

        for pair in raw.split(',') {
            let Some((key, encoded)) = pair.trim().split_once(' ') else {
                continue;
            };
            let Ok(bytes) = BASE64.decode(encoded.trim()) else {
                continue;
            };
            let Ok(value) = String::from_utf8(bytes) else {
                continue;
            };

            match key {
                "filename" => metadata.filename = Some(value),
                "filetype" => metadata.filetype = Some(value),
                "withFilename" => metadata.with_filename = Some(value),
                "onDuplicate" => metadata.on_duplicate = Some(value),
                "destinationPath" => metadata.destination_path = Some(value),
                "multipartId" => metadata.multipart_id = Some(value),
                "partIndex" => metadata.part_index = Some(value),
                "totalParts" => metadata.total_parts = Some(value),
                "originalFileSize" => metadata.original_file_size = Some(value),
                _ => {}
            }
        }

        metadata
    }

    /// Encodes this metadata as an `Upload-Metadata` header value.
    #[must_use]
    pub fn to_header(&self) -> String {
        let fields = [
            ("filename", &self.filename),
            ("filetype", &self.filetype),
            ("withFilename", &self.with_filename),
            ("onDuplicate", &self.on_duplicate),
            ("destinationPath", &self.destination_path),
            ("multipartId", &self.multipart_id),
            ("partIndex", &self.part_index),
            ("totalParts", &self.total_parts),
            ("originalFileSize", &self.original_file_size),
        ];

        fields
            .iter()
            .filter_map(|(key, value)| {
                value
                    .as_ref()
                    .map(|v| format!("{key} {}", BASE64.encode(v.as_bytes())))
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// An upload is a multipart part iff all three group fields are present
    /// and the group has more than one part.
    #[must_use]
    pub fn is_multipart_part(&self) -> bool {
        self.multipart_id.is_some()
            && self.part_index.is_some()
            && self.total_parts.as_deref().is_some_and(|t| t != "1")
    }

    /// Parsed `(part_index, total_parts)` of a multipart part.
    #[must_use]
    pub fn part_numbers(&self) -> Option<(u32, u32)> {
        let index = self.part_index.as_deref()?.parse().ok()?;
        let total = self.total_parts.as_deref()?.parse().ok()?;
        Some((index, total))
    }

    /// Parsed size of the reassembled logical file.
    #[must_use]
    pub fn original_size(&self) -> Option<u64> {
        self.original_file_size.as_deref()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_pairs() {
        let raw = format!(
            "filename {},withFilename {},onDuplicate {}",
            BASE64.encode("report.pdf"),
            BASE64.encode("original"),
            BASE64.encode("number"),
        );

        let metadata = UploadMetadata::parse_header(&raw);
        assert_eq!(metadata.filename.as_deref(), Some("report.pdf"));
        assert_eq!(metadata.with_filename.as_deref(), Some("original"));
        assert_eq!(metadata.on_duplicate.as_deref(), Some("number"));
        assert_eq!(metadata.destination_path, None);
    }

    #[test]
    fn drops_malformed_pairs() {
        let raw = format!(
            "filename,not%base64 !!!,unknown {},filetype {}",
            BASE64.encode("x"),
            BASE64.encode("application/pdf"),
        );

        let metadata = UploadMetadata::parse_header(&raw);
        assert_eq!(metadata.filename, None);
        assert_eq!(metadata.filetype.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn header_round_trip() {
        let metadata = UploadMetadata {
            filename: Some("a b.bin".to_string()),
            multipart_id: Some("m1".to_string()),
            part_index: Some("2".to_string()),
            total_parts: Some("3".to_string()),
            original_file_size: Some("1024".to_string()),
            ..UploadMetadata::default()
        };

        let parsed = UploadMetadata::parse_header(&metadata.to_header());
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn multipart_detection() {
        let mut metadata = UploadMetadata {
            multipart_id: Some("m1".to_string()),
            part_index: Some("1".to_string()),
            total_parts: Some("3".to_string()),
            ..UploadMetadata::default()
        };
        assert!(metadata.is_multipart_part());
        assert_eq!(metadata.part_numbers(), Some((1, 3)));

        metadata.total_parts = Some("1".to_string());
        assert!(!metadata.is_multipart_part());

        metadata.total_parts = None;
        assert!(!metadata.is_multipart_part());
    }
}
