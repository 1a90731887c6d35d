use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use url::Url;

use super::{ConfigurationError, Result, TaskType};
use crate::hash::{Hash, HashAlgorithm, HashStrategy};

fn parse_uri(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| ConfigurationError::InvalidUri {
        field: field.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTaskConfiguration {
    pub locations: Vec<String>,
}

/// One requested digest; a missing offset or length covers the whole content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashInput {
    pub hash_algorithm: HashAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl HashInput {
    pub fn whole(hash_algorithm: HashAlgorithm) -> Self {
        Self {
            hash_algorithm,
            offset: None,
            length: None,
        }
    }

    pub fn strategy(&self) -> HashStrategy {
        HashStrategy::span(self.hash_algorithm, self.offset, self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashTaskConfiguration {
    pub source: String,
    pub hashes: Vec<HashInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashTaskOutput {
    pub hashes: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInstruction {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTaskConfiguration {
    pub transfers: Vec<TransferInstruction>,
}

/// What a single transfer moved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub source: String,
    pub destination: String,
    pub length: u64,
    pub hashes: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTaskOutput {
    pub contents: Vec<ContentInfo>,
}

/// Precomputed multipart part descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsUploadPart {
    pub number: u32,
    pub offset: u64,
    pub length: u64,
    /// Hex SHA-256 of the part bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_hash: Option<String>,
    /// Checksum passed to the service (Content-MD5 or tree-hash)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_hash: Option<String>,
}

impl AwsUploadPart {
    /// Exclusive end offset; `None` when it does not fit in a `u64`
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Shared by the S3 and Glacier upload tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsUploadTaskConfiguration {
    pub source: String,
    pub destination: String,
    pub part_size: u64,
    pub parts: Vec<AwsUploadPart>,
    #[serde(default)]
    pub hash_algorithms: Vec<HashAlgorithm>,
}

impl AwsUploadTaskConfiguration {
    /// Parts in ascending number order, checked for duplicates, overlap and
    /// size. Every part but the last must fit in `part_size`; the last may
    /// carry the remainder.
    pub fn ordered_parts(&self) -> Result<Vec<AwsUploadPart>> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(|part| part.number);

        let mut numbers = BTreeSet::new();
        for part in &parts {
            if part.number == 0 {
                return Err(ConfigurationError::invalid("parts", "part numbers start at 1"));
            }
            if part.length == 0 {
                return Err(ConfigurationError::invalid(
                    "parts",
                    format!("part {} is empty", part.number),
                ));
            }
            if !numbers.insert(part.number) {
                return Err(ConfigurationError::invalid(
                    "parts",
                    format!("duplicate part number {}", part.number),
                ));
            }
            if part.end().is_none() {
                return Err(ConfigurationError::invalid(
                    "parts",
                    format!("part {} ends beyond the largest offset", part.number),
                ));
            }
        }

        if let Some((_, leading)) = parts.split_last() {
            if let Some(part) = leading.iter().find(|part| part.length > self.part_size) {
                return Err(ConfigurationError::invalid(
                    "parts",
                    format!(
                        "part {} is {} bytes, larger than part_size {}",
                        part.number, part.length, self.part_size
                    ),
                ));
            }
        }

        for pair in parts.windows(2) {
            if pair[0].end().is_none_or(|end| pair[1].offset < end) {
                return Err(ConfigurationError::invalid(
                    "parts",
                    format!("part {} overlaps part {}", pair[1].number, pair[0].number),
                ));
            }
        }

        Ok(parts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Part {
    pub number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3UploadTaskOutput {
    pub parts: Vec<S3Part>,
    pub hashes: Vec<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlacierUploadTaskOutput {
    pub hashes: Vec<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreTaskConfiguration {
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreTaskOutput {
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestParseTaskConfiguration {
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default)]
    pub hashes: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestParseTaskOutput {
    pub files: Vec<ManifestFile>,
}

/// Task configuration, one variant per task type
#[derive(Debug, Clone, PartialEq)]
pub enum TaskConfiguration {
    Delete(DeleteTaskConfiguration),
    Hash(HashTaskConfiguration),
    Transfer(TransferTaskConfiguration),
    S3Upload(AwsUploadTaskConfiguration),
    GlacierUpload(AwsUploadTaskConfiguration),
    Restore(RestoreTaskConfiguration),
    ManifestParse(ManifestParseTaskConfiguration),
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn encode<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl TaskConfiguration {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskConfiguration::Delete(_) => TaskType::Delete,
            TaskConfiguration::Hash(_) => TaskType::Hash,
            TaskConfiguration::Transfer(_) => TaskType::Transfer,
            TaskConfiguration::S3Upload(_) => TaskType::S3Upload,
            TaskConfiguration::GlacierUpload(_) => TaskType::GlacierUpload,
            TaskConfiguration::Restore(_) => TaskType::Restore,
            TaskConfiguration::ManifestParse(_) => TaskType::ManifestParse,
        }
    }

    /// Decode and validate the configuration of a `task_type` task
    pub fn from_json(task_type: TaskType, value: Value) -> Result<Self> {
        let configuration = match task_type {
            TaskType::Delete => TaskConfiguration::Delete(decode(value)?),
            TaskType::Hash => TaskConfiguration::Hash(decode(value)?),
            TaskType::Transfer => TaskConfiguration::Transfer(decode(value)?),
            TaskType::S3Upload => TaskConfiguration::S3Upload(decode(value)?),
            TaskType::GlacierUpload => TaskConfiguration::GlacierUpload(decode(value)?),
            TaskType::Restore => TaskConfiguration::Restore(decode(value)?),
            TaskType::ManifestParse => TaskConfiguration::ManifestParse(decode(value)?),
        };
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn to_json(&self) -> Value {
        match self {
            TaskConfiguration::Delete(c) => encode(c),
            TaskConfiguration::Hash(c) => encode(c),
            TaskConfiguration::Transfer(c) => encode(c),
            TaskConfiguration::S3Upload(c) | TaskConfiguration::GlacierUpload(c) => encode(c),
            TaskConfiguration::Restore(c) => encode(c),
            TaskConfiguration::ManifestParse(c) => encode(c),
        }
    }

    /// URI syntax and structural checks; no I/O
    pub fn validate(&self) -> Result<()> {
        match self {
            TaskConfiguration::Delete(c) => {
                for (i, location) in c.locations.iter().enumerate() {
                    parse_uri(&format!("locations[{}]", i), location)?;
                }
            }
            TaskConfiguration::Hash(c) => {
                parse_uri("source", &c.source)?;
                if c.hashes.is_empty() {
                    return Err(ConfigurationError::invalid("hashes", "at least one hash is required"));
                }
            }
            TaskConfiguration::Transfer(c) => {
                for (i, transfer) in c.transfers.iter().enumerate() {
                    parse_uri(&format!("transfers[{}].source", i), &transfer.source)?;
                    parse_uri(&format!("transfers[{}].destination", i), &transfer.destination)?;
                }
            }
            TaskConfiguration::S3Upload(c) | TaskConfiguration::GlacierUpload(c) => {
                parse_uri("source", &c.source)?;
                parse_uri("destination", &c.destination)?;
                if c.part_size == 0 {
                    return Err(ConfigurationError::invalid("part_size", "must be positive"));
                }
                if c.parts.is_empty() {
                    return Err(ConfigurationError::invalid("parts", "at least one part is required"));
                }
                c.ordered_parts()?;
            }
            TaskConfiguration::Restore(c) => {
                parse_uri("source", &c.source)?;
            }
            TaskConfiguration::ManifestParse(c) => {
                parse_uri("source", &c.source)?;
            }
        }
        Ok(())
    }
}

/// Task output, one variant per task type that produces one
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Hash(HashTaskOutput),
    Transfer(TransferTaskOutput),
    S3Upload(S3UploadTaskOutput),
    GlacierUpload(GlacierUploadTaskOutput),
    Restore(RestoreTaskOutput),
    ManifestParse(ManifestParseTaskOutput),
}

impl TaskOutput {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskOutput::Hash(_) => TaskType::Hash,
            TaskOutput::Transfer(_) => TaskType::Transfer,
            TaskOutput::S3Upload(_) => TaskType::S3Upload,
            TaskOutput::GlacierUpload(_) => TaskType::GlacierUpload,
            TaskOutput::Restore(_) => TaskType::Restore,
            TaskOutput::ManifestParse(_) => TaskType::ManifestParse,
        }
    }

    pub fn from_json(task_type: TaskType, value: Value) -> Result<Self> {
        Ok(match task_type {
            TaskType::Hash => TaskOutput::Hash(decode(value)?),
            TaskType::Transfer => TaskOutput::Transfer(decode(value)?),
            TaskType::S3Upload => TaskOutput::S3Upload(decode(value)?),
            TaskType::GlacierUpload => TaskOutput::GlacierUpload(decode(value)?),
            TaskType::Restore => TaskOutput::Restore(decode(value)?),
            TaskType::ManifestParse => TaskOutput::ManifestParse(decode(value)?),
            TaskType::Delete => {
                return Err(ConfigurationError::invalid("output", "delete tasks produce no output"));
            }
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            TaskOutput::Hash(o) => encode(o),
            TaskOutput::Transfer(o) => encode(o),
            TaskOutput::S3Upload(o) => encode(o),
            TaskOutput::GlacierUpload(o) => encode(o),
            TaskOutput::Restore(o) => encode(o),
            TaskOutput::ManifestParse(o) => encode(o),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upload_json(parts: Value) -> Value {
        json!({
            "source": "file:///media/master.mov",
            "destination": "s3://A:B@media.s3.amazonaws.com/master.mov",
            "part_size": 4194304,
            "parts": parts,
            "hash_algorithms": ["MD5"]
        })
    }

    #[test]
    fn test_upload_configuration_parses() {
        let parts = json!([{"number": 1, "offset": 0, "length": 10486525, "signing_hash": "ab"}]);
        let config = TaskConfiguration::from_json(TaskType::S3Upload, upload_json(parts)).unwrap();

        let TaskConfiguration::S3Upload(upload) = config else {
            panic!("expected s3 upload");
        };
        assert_eq!(upload.part_size, 4_194_304);
        assert_eq!(upload.hash_algorithms, vec![HashAlgorithm::Md5]);
        assert_eq!(upload.parts[0].part_hash, None);
    }

    #[test]
    fn test_parts_are_sorted_and_checked() {
        let parts = json!([
            {"number": 2, "offset": 10, "length": 10},
            {"number": 1, "offset": 0, "length": 10}
        ]);
        let config: AwsUploadTaskConfiguration = serde_json::from_value(upload_json(parts)).unwrap();
        let ordered = config.ordered_parts().unwrap();
        assert_eq!(ordered[0].number, 1);
        assert_eq!(ordered[1].offset, 10);

        let overlapping = json!([
            {"number": 1, "offset": 0, "length": 10},
            {"number": 2, "offset": 5, "length": 10}
        ]);
        assert!(TaskConfiguration::from_json(TaskType::GlacierUpload, upload_json(overlapping)).is_err());

        let duplicate = json!([
            {"number": 1, "offset": 0, "length": 10},
            {"number": 1, "offset": 10, "length": 10}
        ]);
        assert!(TaskConfiguration::from_json(TaskType::S3Upload, upload_json(duplicate)).is_err());
    }

    #[test]
    fn test_part_ending_past_u64_is_rejected() {
        let parts = json!([
            {"number": 1, "offset": u64::MAX, "length": 1},
            {"number": 2, "offset": 0, "length": 1}
        ]);
        let err = TaskConfiguration::from_json(TaskType::S3Upload, upload_json(parts)).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidField { field, .. } if field == "parts"));
    }

    #[test]
    fn test_only_the_last_part_may_exceed_part_size() {
        let mut oversized = upload_json(json!([
            {"number": 1, "offset": 0, "length": 1_099_511_627_776u64},
            {"number": 2, "offset": 1_099_511_627_776u64, "length": 4}
        ]));
        oversized["part_size"] = json!(4);
        let err = TaskConfiguration::from_json(TaskType::S3Upload, oversized).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidField { field, .. } if field == "parts"));

        let mut remainder = upload_json(json!([
            {"number": 1, "offset": 0, "length": 4},
            {"number": 2, "offset": 4, "length": 6}
        ]));
        remainder["part_size"] = json!(4);
        assert!(TaskConfiguration::from_json(TaskType::S3Upload, remainder).is_ok());
    }

    #[test]
    fn test_zero_part_size_is_rejected() {
        let mut value = upload_json(json!([{"number": 1, "offset": 0, "length": 1}]));
        value["part_size"] = json!(0);
        let err = TaskConfiguration::from_json(TaskType::S3Upload, value).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidField { field, .. } if field == "part_size"));
    }

    #[test]
    fn test_malformed_uri_names_field() {
        let value = json!({"locations": ["file:///ok", "::not a uri::"]});
        let err = TaskConfiguration::from_json(TaskType::Delete, value).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidUri { field, .. } if field == "locations[1]"));
    }

    #[test]
    fn test_unknown_algorithm_is_configuration_error() {
        let value = json!({"source": "file:///a", "hashes": [{"hash_algorithm": "CRC32"}]});
        let err = TaskConfiguration::from_json(TaskType::Hash, value).unwrap_err();
        assert!(err.to_string().contains("CRC32"));
    }

    #[test]
    fn test_output_shapes() {
        let output = TaskOutput::S3Upload(S3UploadTaskOutput {
            parts: vec![S3Part {
                number: 1,
                etag: "\"e1\"".into(),
            }],
            hashes: vec![],
            location: None,
        });
        let json = output.to_json();
        assert_eq!(json["parts"][0]["etag"], "\"e1\"");
        assert!(json.get("location").is_none());

        assert_eq!(TaskOutput::from_json(TaskType::S3Upload, json).unwrap(), output);
        assert!(TaskOutput::from_json(TaskType::Delete, json!({})).is_err());
    }
}
