//! Entity kinds and their per-entity sync configuration

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::util::{format_timestamp, normalize_calendar_date, parse_timestamp};

use super::record::Fields;

/// Every synchronizable entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Category,
    WatchSource,
    MediaItem,
    ProgressLog,
    Run,
    Review,
    GalleryImage,
}

impl EntityKind {
    /// All kinds in catalog order.
    pub const ALL: [Self; 7] = [
        Self::Category,
        Self::WatchSource,
        Self::MediaItem,
        Self::ProgressLog,
        Self::Run,
        Self::Review,
        Self::GalleryImage,
    ];

    /// Sync configuration for this kind.
    #[must_use]
    pub fn spec(self) -> &'static EntitySpec {
        match self {
            Self::Category => &CATALOG[0],
            Self::WatchSource => &CATALOG[1],
            Self::MediaItem => &CATALOG[2],
            Self::ProgressLog => &CATALOG[3],
            Self::Run => &CATALOG[4],
            Self::Review => &CATALOG[5],
            Self::GalleryImage => &CATALOG[6],
        }
    }

    /// Table name, shared by the local and the remote store.
    #[must_use]
    pub fn table(self) -> &'static str {
        self.spec().table
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Category => "category",
            Self::WatchSource => "watch source",
            Self::MediaItem => "media item",
            Self::ProgressLog => "progress log",
            Self::Run => "run",
            Self::Review => "review",
            Self::GalleryImage => "gallery image",
        };
        f.write_str(label)
    }
}

/// How a field is normalized before transmission and comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Real,
    Boolean,
    /// Calendar date, always rendered `YYYY-MM-DD`
    Date,
    /// Instant, always rendered RFC 3339 UTC with millisecond precision
    Timestamp,
    /// Opaque payload, passed through untouched
    Json,
}

impl FieldKind {
    /// Canonical form of a value of this kind.
    ///
    /// Values that cannot be interpreted are passed through unchanged so that
    /// no user data is lost.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn normalize(self, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match self {
            Self::Text | Self::Json => value.clone(),
            Self::Integer => match value {
                Value::Number(number) if number.is_f64() => number
                    .as_f64()
                    .filter(|float| float.fract() == 0.0)
                    .map_or_else(|| value.clone(), |float| Value::from(float as i64)),
                _ => value.clone(),
            },
            Self::Real => value.as_f64().map_or_else(|| value.clone(), Value::from),
            Self::Boolean => match value {
                Value::Number(number) => number
                    .as_i64()
                    .map_or_else(|| value.clone(), |int| Value::Bool(int != 0)),
                _ => value.clone(),
            },
            Self::Date => value
                .as_str()
                .and_then(normalize_calendar_date)
                .map_or_else(|| value.clone(), Value::String),
            Self::Timestamp => {
                let millis = match value {
                    Value::String(text) => parse_timestamp(text),
                    Value::Number(number) => number.as_i64(),
                    _ => None,
                };
                millis.map_or_else(|| value.clone(), |ms| Value::String(format_timestamp(ms)))
            }
        }
    }
}

/// Mapping of one field between the local and remote shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Key in the local record's field set
    pub local: &'static str,
    /// Column on the remote row
    pub remote: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    const fn new(local: &'static str, remote: &'static str, kind: FieldKind) -> Self {
        Self {
            local,
            remote,
            kind,
        }
    }

    const fn same(name: &'static str, kind: FieldKind) -> Self {
        Self::new(name, name, kind)
    }
}

/// Foreign-key role of an entity towards its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    pub kind: EntityKind,
    /// Remote foreign-key column holding the parent's remote id
    pub column: &'static str,
    /// Whether a record is meaningless without its parent
    pub required: bool,
}

/// Per-entity adapter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySpec {
    pub kind: EntityKind,
    pub table: &'static str,
    pub parent: Option<ParentLink>,
    pub fields: &'static [FieldSpec],
}

impl EntitySpec {
    /// Look up a field by its local key.
    pub fn field(&self, local: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.local == local)
    }

    /// Reject keys the entity does not declare.
    pub fn validate_fields(&self, fields: &Fields) -> Result<()> {
        let unknown: Vec<&str> = fields
            .keys()
            .filter(|key| self.field(key).is_none())
            .map(String::as_str)
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "Unknown {} field(s): {}",
                self.kind,
                unknown.join(", ")
            )))
        }
    }

    /// Normalized local field set, keyed by local names.
    pub fn local_view(&self, fields: &Fields) -> Fields {
        self.fields
            .iter()
            .map(|field| {
                let value = fields.get(field.local).unwrap_or(&Value::Null);
                (field.local.to_string(), field.kind.normalize(value))
            })
            .collect()
    }

    /// Normalized local field set read from remote columns.
    pub fn fields_from_columns(&self, columns: &Map<String, Value>) -> Fields {
        self.fields
            .iter()
            .map(|field| {
                let value = columns.get(field.remote).unwrap_or(&Value::Null);
                (field.local.to_string(), field.kind.normalize(value))
            })
            .collect()
    }

    /// Remote columns for a local field set (parent key excluded).
    pub fn columns_from_fields(&self, fields: &Fields) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|field| {
                let value = fields.get(field.local).unwrap_or(&Value::Null);
                (field.remote.to_string(), field.kind.normalize(value))
            })
            .collect()
    }
}

const CATEGORY_FIELDS: &[FieldSpec] = &[
    FieldSpec::same("name", FieldKind::Text),
    FieldSpec::same("color", FieldKind::Text),
    FieldSpec::same("sort_order", FieldKind::Integer),
];

const WATCH_SOURCE_FIELDS: &[FieldSpec] = &[
    FieldSpec::same("name", FieldKind::Text),
    FieldSpec::same("base_url", FieldKind::Text),
];

const MEDIA_ITEM_FIELDS: &[FieldSpec] = &[
    FieldSpec::same("title", FieldKind::Text),
    FieldSpec::same("media_type", FieldKind::Text),
    FieldSpec::same("status", FieldKind::Text),
    FieldSpec::new("cover_image", "cover_url", FieldKind::Text),
    FieldSpec::same("external_id", FieldKind::Text),
    FieldSpec::same("total_units", FieldKind::Integer),
    FieldSpec::same("score", FieldKind::Real),
    FieldSpec::same("notes", FieldKind::Text),
    FieldSpec::same("metadata", FieldKind::Json),
];

const PROGRESS_LOG_FIELDS: &[FieldSpec] = &[
    FieldSpec::same("progress", FieldKind::Integer),
    FieldSpec::same("start_date", FieldKind::Date),
    FieldSpec::same("end_date", FieldKind::Date),
    FieldSpec::same("note", FieldKind::Text),
];

const RUN_FIELDS: &[FieldSpec] = &[
    FieldSpec::same("run_number", FieldKind::Integer),
    FieldSpec::same("status", FieldKind::Text),
    FieldSpec::same("start_date", FieldKind::Date),
    FieldSpec::same("end_date", FieldKind::Date),
];

const REVIEW_FIELDS: &[FieldSpec] = &[
    FieldSpec::same("rating", FieldKind::Real),
    FieldSpec::same("body", FieldKind::Text),
    FieldSpec::same("written_on", FieldKind::Date),
];

const GALLERY_IMAGE_FIELDS: &[FieldSpec] = &[
    FieldSpec::same("url", FieldKind::Text),
    FieldSpec::same("caption", FieldKind::Text),
    FieldSpec::same("captured_at", FieldKind::Timestamp),
];

const MEDIA_ITEM_PARENT: Option<ParentLink> = Some(ParentLink {
    kind: EntityKind::MediaItem,
    column: "media_item_id",
    required: true,
});

static CATALOG: [EntitySpec; 7] = [
    EntitySpec {
        kind: EntityKind::Category,
        table: "categories",
        parent: None,
        fields: CATEGORY_FIELDS,
    },
    EntitySpec {
        kind: EntityKind::WatchSource,
        table: "watch_sources",
        parent: None,
        fields: WATCH_SOURCE_FIELDS,
    },
    EntitySpec {
        kind: EntityKind::MediaItem,
        table: "media_items",
        parent: Some(ParentLink {
            kind: EntityKind::Category,
            column: "category_id",
            required: false,
        }),
        fields: MEDIA_ITEM_FIELDS,
    },
    EntitySpec {
        kind: EntityKind::ProgressLog,
        table: "progress_logs",
        parent: MEDIA_ITEM_PARENT,
        fields: PROGRESS_LOG_FIELDS,
    },
    EntitySpec {
        kind: EntityKind::Run,
        table: "runs",
        parent: MEDIA_ITEM_PARENT,
        fields: RUN_FIELDS,
    },
    EntitySpec {
        kind: EntityKind::Review,
        table: "reviews",
        parent: MEDIA_ITEM_PARENT,
        fields: REVIEW_FIELDS,
    },
    EntitySpec {
        kind: EntityKind::GalleryImage,
        table: "gallery_images",
        parent: MEDIA_ITEM_PARENT,
        fields: GALLERY_IMAGE_FIELDS,
    },
];

/// The full entity catalog, in declaration order.
#[must_use]
pub fn catalog() -> Vec<EntitySpec> {
    CATALOG.to_vec()
}
