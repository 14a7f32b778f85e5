use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use tokio::fs;

use granary_types::normalize_identifier;

/// Header name of the canonical identifier column.
const IDENTIFIER_COLUMN: &str = "symbol";

/// The fixed universe of entity identifiers to process, loaded once per run
/// from a CSV file. Read-only after load; order follows the file, first
/// occurrence wins.
#[derive(Debug, Clone)]
pub struct Catalog {
    identifiers: Vec<String>,
}

impl Catalog {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse catalog {}", path.display()))
    }

    fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut lines = raw.lines();
        let header = lines.next().context("catalog file is empty")?;
        let column = header
            .split(',')
            .position(|cell| cell.trim() == IDENTIFIER_COLUMN)
            .with_context(|| format!("catalog header has no `{IDENTIFIER_COLUMN}` column"))?;

        let mut seen = HashSet::new();
        let mut identifiers = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let cell = line.split(',').nth(column).unwrap_or("");
            let Some(identifier) = normalize_identifier(cell) else {
                continue;
            };
            if seen.insert(identifier.clone()) {
                identifiers.push(identifier);
            }
        }
        Ok(Self { identifiers })
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symbol_column_with_padding_and_dedup() {
        let catalog = Catalog::parse(
            "ts_code,symbol,name\n600519.SH,600519,Kweichow\n000001.SZ,1,Ping An\n,,blank\n600519.SH,600519,dup\n",
        )
        .expect("catalog");
        assert_eq!(catalog.identifiers(), ["600519", "000001"]);
    }

    #[test]
    fn missing_column_is_an_error() {
        let err = Catalog::parse("ts_code,name\nx,y\n").unwrap_err();
        assert!(err.to_string().contains("symbol"));
    }

    #[test]
    fn empty_file_is_an_error() {
        assert!(Catalog::parse("").is_err());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Catalog::load(&dir.path().join("absent.csv")).await.unwrap_err();
        assert!(err.to_string().contains("absent.csv"));
    }
}
