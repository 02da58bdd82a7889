//! Configuration loading for archivectl

use std::path::Path;

use anyhow::{Context, Result};
use archivist_sink::ArchiverConfig;

/// Settings given on the command line or through the environment. They win
/// over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub chunk_max_records: Option<usize>,
}

impl Overrides {
    pub fn apply(&self, config: &mut ArchiverConfig) {
        if let Some(bucket) = &self.bucket {
            config.bucket = bucket.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(region) = &self.region {
            config.region = region.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = Some(endpoint.clone());
            config.allow_http = endpoint.starts_with("http://");
        }
        if let Some(records) = self.chunk_max_records {
            config.chunk_max_records = records;
        }
    }
}

/// Load the archiver config from a TOML file, or start from defaults.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<ArchiverConfig> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            parse(&contents).with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => ArchiverConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("Invalid archiver configuration")?;
    Ok(config)
}

fn parse(contents: &str) -> Result<ArchiverConfig> {
    Ok(toml::from_str(contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist_sink::{RecordFormat, RenderErrorPolicy};
    use std::io::Write;

    #[test]
    fn test_parse_minimal_file() {
        let config = parse(
            r#"
            bucket = "archive-bucket"
            prefix = "systest"
        "#,
        )
        .unwrap();
        assert_eq!(config.bucket, "archive-bucket");
        assert_eq!(config.prefix, "systest");
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.group_max_chunks, 1);
        assert_eq!(config.format, RecordFormat::Value);
    }

    #[test]
    fn test_parse_full_file() {
        let config = parse(
            r#"
            bucket = "b"
            prefix = "p"
            endpoint = "http://localhost:9000"
            allow_http = true
            chunk_max_records = 40
            group_max_chunks = 3
            format = "json"
            on_render_error = "skip"
            conditional_pointer_writes = true
        "#,
        )
        .unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.chunk_max_records, 40);
        assert_eq!(config.group_max_chunks, 3);
        assert_eq!(config.format, RecordFormat::Json);
        assert_eq!(config.on_render_error, RenderErrorPolicy::Skip);
        assert!(config.conditional_pointer_writes);
    }

    #[test]
    fn test_missing_bucket_rejected() {
        assert!(parse("prefix = \"p\"").is_err());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bucket = \"from-file\"\nprefix = \"p\"\nchunk_max_records = 10").unwrap();

        let overrides = Overrides {
            bucket: Some("from-flag".to_string()),
            endpoint: Some("http://minio:9000".to_string()),
            chunk_max_records: Some(5),
            ..Default::default()
        };
        let config = load(Some(file.path()), &overrides).unwrap();
        assert_eq!(config.bucket, "from-flag");
        assert_eq!(config.prefix, "p");
        assert_eq!(config.chunk_max_records, 5);
        assert!(config.allow_http);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load(None, &Overrides::default()).unwrap();
        assert_eq!(config, ArchiverConfig::default());
    }

    #[test]
    fn test_invalid_override_rejected() {
        let overrides = Overrides {
            chunk_max_records: Some(0),
            ..Default::default()
        };
        assert!(load(None, &overrides).is_err());
    }
}
