//! Canonical schema lineages
//!
//! A lineage is the ordered history of one data model's schema. Each entry is
//! a JSON schema tagged with a `[major, minor]` version; minors within a major
//! are backwards compatible, a new major is a breaking change.
//!
//! ```json
//! {
//!   "name": "datasource",
//!   "schemas": [
//!     { "version": [0, 0], "schema": { "type": "object", "properties": { ... } } }
//!   ]
//! }
//! ```

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::Error;

/// A `major.minor` schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(from = "[u32; 2]")]
pub struct SyntacticVersion {
    /// Breaking-change counter
    pub major: u32,
    /// Compatible-change counter within the major
    pub minor: u32,
}

impl SyntacticVersion {
    /// Create a version
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl From<[u32; 2]> for SyntacticVersion {
    fn from([major, minor]: [u32; 2]) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for SyntacticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Where a lineage document is read from
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// A file on disk
    Path(PathBuf),
    /// A document compiled into the binary
    Embedded {
        /// Name used in error messages (usually the original file name)
        name: &'static str,
        /// The lineage document
        contents: &'static str,
    },
}

impl SchemaSource {
    /// Human-readable location of the source
    pub fn describe(&self) -> String {
        match self {
            SchemaSource::Path(path) => path.display().to_string(),
            SchemaSource::Embedded { name, .. } => format!("embedded:{}", name),
        }
    }

    fn read(&self) -> Result<Cow<'static, str>, Error> {
        match self {
            SchemaSource::Path(path) => std::fs::read_to_string(path)
                .map(Cow::Owned)
                .map_err(|e| Error::schema_source(self.describe(), e.to_string())),
            SchemaSource::Embedded { contents, .. } => Ok(Cow::Borrowed(contents)),
        }
    }
}

/// One schema in a lineage
#[derive(Debug, Clone, Deserialize)]
pub struct VersionedSchema {
    /// Version of this schema
    pub version: SyntacticVersion,
    /// JSON schema of the data model at this version
    pub schema: Value,
}

#[derive(Debug, Deserialize)]
struct LineageDocument {
    name: String,
    schemas: Vec<VersionedSchema>,
}

/// A loaded, validated lineage
#[derive(Debug, Clone)]
pub struct Lineage {
    name: String,
    schemas: Vec<VersionedSchema>,
}

impl Lineage {
    /// Read and validate a lineage from its source
    pub fn load(source: &SchemaSource) -> Result<Self, Error> {
        let text = source.read()?;
        Self::parse(&source.describe(), &text)
    }

    /// Parse and validate a lineage document
    ///
    /// The lineage must be named, non-empty, strictly ordered by version, and
    /// every schema must be a JSON object or boolean schema.
    pub fn parse(origin: &str, text: &str) -> Result<Self, Error> {
        let doc: LineageDocument = serde_json::from_str(text)
            .map_err(|e| Error::schema_source(origin, format!("malformed lineage: {}", e)))?;

        if doc.name.is_empty() {
            return Err(Error::schema_source(origin, "lineage has no name"));
        }
        if doc.schemas.is_empty() {
            return Err(Error::schema_source(origin, "lineage has no schemas"));
        }
        for pair in doc.schemas.windows(2) {
            if pair[0].version >= pair[1].version {
                return Err(Error::schema_source(
                    origin,
                    format!(
                        "schema versions out of order: {} is followed by {}",
                        pair[0].version, pair[1].version
                    ),
                ));
            }
        }
        if let Some(bad) = doc
            .schemas
            .iter()
            .find(|s| !(s.schema.is_object() || s.schema.is_boolean()))
        {
            return Err(Error::schema_source(
                origin,
                format!("schema {} is not a JSON schema object", bad.version),
            ));
        }

        Ok(Self {
            name: doc.name,
            schemas: doc.schemas,
        })
    }

    /// Canonical name of the schematized object
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All schemas, oldest first
    pub fn schemas(&self) -> &[VersionedSchema] {
        &self.schemas
    }

    /// Latest schema version in the lineage
    pub fn latest_version(&self) -> SyntacticVersion {
        self.schemas
            .last()
            .map(|s| s.version)
            .unwrap_or(SyntacticVersion::new(0, 0))
    }

    /// Resolve the latest schema compatible with `version`
    ///
    /// Picks the newest schema with the same major and a minor no greater than
    /// the requested one.
    pub fn resolve(&self, version: SyntacticVersion) -> Result<&VersionedSchema, Error> {
        self.schemas
            .iter()
            .rev()
            .find(|s| s.version.major == version.major && s.version.minor <= version.minor)
            .ok_or_else(|| {
                Error::schema_mismatch(
                    &self.name,
                    format!(
                        "no schema compatible with version {} (latest is {})",
                        version,
                        self.latest_version()
                    ),
                )
            })
    }
}
