//! Region catalog: the named bounding regions a shelf is expected to contain.
//!
//! Catalog files are hand-edited, so loading is strict: any malformed entry
//! rejects the whole load. The live catalog is never mutated in place;
//! `CatalogStore::reload` builds a new `Catalog` and swaps the `Arc`, so a
//! detection pass that already holds a snapshot keeps seeing it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CatalogError;

/// Axis-aligned box in source-image pixel coordinates, xyxy order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> f64 {
        self.width() as f64 * self.height() as f64
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    /// Intersection-over-union. Zero when the boxes do not overlap.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0) as f64 * (iy2 - iy1).max(0) as f64;
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }

    pub fn as_array(&self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub product_id: String,
    pub display_name: String,
    pub bounding_box: BoundingBox,
}

/// Immutable catalog snapshot, ordered by `product_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    /// Build a catalog from entries, rejecting duplicates and invalid boxes.
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for entry in entries {
            validate_product_id(&entry.product_id)?;
            check_box(&entry.product_id, entry.bounding_box)?;
            if map.contains_key(&entry.product_id) {
                return Err(CatalogError::DuplicateId(entry.product_id));
            }
            map.insert(entry.product_id.clone(), entry);
        }
        Ok(Self { entries: map })
    }

    /// Load a catalog from a single JSON file or a directory of per-product files.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        if path.is_dir() {
            load_dir(path)
        } else {
            let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Self::parse(&raw, path)
        }
    }

    /// Parse the single-file form: an object keyed by product id.
    pub fn parse(raw: &str, origin: &Path) -> Result<Self, CatalogError> {
        let pairs: OrderedPairs =
            serde_json::from_str(raw).map_err(|e| CatalogError::Malformed {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        let mut entries = Vec::with_capacity(pairs.0.len());
        for (product_id, value) in pairs.0 {
            entries.push(entry_from_value(product_id, &value, origin)?);
        }
        Self::from_entries(entries)
    }

    pub fn get(&self, product_id: &str) -> Option<&CatalogEntry> {
        self.entries.get(product_id)
    }

    /// Entries in ascending `product_id` order.
    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn load_dir(dir: &Path) -> Result<Catalog, CatalogError> {
    let io_err = |source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        })
        .collect();
    files.sort();

    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let raw = std::fs::read_to_string(&file).map_err(|source| CatalogError::Io {
            path: file.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| CatalogError::Malformed {
            path: file.clone(),
            message: e.to_string(),
        })?;
        let stem = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let product_id = value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(stem);
        entries.push(entry_from_value(product_id, &value, &file)?);
    }
    Catalog::from_entries(entries)
}

fn entry_from_value(
    product_id: String,
    value: &Value,
    origin: &Path,
) -> Result<CatalogEntry, CatalogError> {
    let (display_name, coords) = match value {
        Value::Array(_) => (product_id.clone(), value),
        Value::Object(map) => {
            let name = map
                .get("name")
                .ok_or_else(|| CatalogError::MissingField {
                    product_id: product_id.clone(),
                    field: "name",
                })?
                .as_str()
                .ok_or_else(|| CatalogError::Malformed {
                    path: origin.to_path_buf(),
                    message: format!("'{}': name must be a string", product_id),
                })?;
            let coords = map.get("coords").ok_or_else(|| CatalogError::MissingField {
                product_id: product_id.clone(),
                field: "coords",
            })?;
            (name.to_string(), coords)
        }
        _ => {
            return Err(CatalogError::Malformed {
                path: origin.to_path_buf(),
                message: format!("'{}': expected an object or a coords array", product_id),
            })
        }
    };

    let bounding_box = parse_coords(&product_id, coords, origin)?;
    Ok(CatalogEntry {
        product_id,
        display_name,
        bounding_box,
    })
}

fn parse_coords(product_id: &str, coords: &Value, origin: &Path) -> Result<BoundingBox, CatalogError> {
    let malformed = |message: String| CatalogError::Malformed {
        path: origin.to_path_buf(),
        message,
    };
    let items = coords
        .as_array()
        .ok_or_else(|| malformed(format!("'{}': coords must be an array", product_id)))?;
    if items.len() != 4 {
        return Err(malformed(format!(
            "'{}': coords must have 4 values, found {}",
            product_id,
            items.len()
        )));
    }
    let mut out = [0i64; 4];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.as_i64().ok_or_else(|| {
            malformed(format!(
                "'{}': coordinate {} is not an integer",
                product_id, item
            ))
        })?;
    }
    if out.iter().any(|v| *v < 0 || *v > i32::MAX as i64) {
        return Err(CatalogError::InvalidBox {
            product_id: product_id.to_string(),
            coords: out,
            reason: "coordinates must be non-negative pixel positions",
        });
    }
    let bbox = BoundingBox::new(out[0] as i32, out[1] as i32, out[2] as i32, out[3] as i32);
    check_box(product_id, bbox)?;
    Ok(bbox)
}

fn check_box(product_id: &str, bbox: BoundingBox) -> Result<(), CatalogError> {
    if bbox.is_valid() {
        return Ok(());
    }
    Err(CatalogError::InvalidBox {
        product_id: product_id.to_string(),
        coords: bbox.as_array().map(i64::from),
        reason: "expected x1 < x2 and y1 < y2",
    })
}

/// Product ids are opaque but must be safe as file names and log tokens.
pub fn validate_product_id(product_id: &str) -> Result<(), CatalogError> {
    static PRODUCT_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = PRODUCT_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("static product id pattern")
    });
    if re.is_match(product_id) {
        Ok(())
    } else {
        Err(CatalogError::InvalidId(product_id.to_string()))
    }
}

/// JSON object preserved as ordered key/value pairs so duplicate keys are
/// detected instead of silently collapsed.
struct OrderedPairs(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for OrderedPairs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = OrderedPairs;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object keyed by product id")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    pairs.push((key, value));
                }
                Ok(OrderedPairs(pairs))
            }
        }

        deserializer.deserialize_map(PairsVisitor)
    }
}

// ----------------------------------------------------------------------------
// CatalogStore: load-then-swap holder for the live catalog
// ----------------------------------------------------------------------------

/// Holder for the live catalog. Readers take an `Arc` snapshot; `reload`
/// swaps in a fully validated replacement or leaves the current one alone.
pub struct CatalogStore {
    path: PathBuf,
    current: RwLock<Arc<Catalog>>,
    last_error: RwLock<Option<String>>,
}

impl CatalogStore {
    /// Load the catalog at `path`. Fails if the initial load fails.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let catalog = Catalog::load(&path)?;
        log::info!(
            "catalog: loaded {} entries from {}",
            catalog.len(),
            path.display()
        );
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(catalog)),
            last_error: RwLock::new(None),
        })
    }

    /// Wrap an already-built catalog (tests, embedding).
    pub fn from_catalog(path: impl Into<PathBuf>, catalog: Catalog) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(catalog)),
            last_error: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent snapshot of the live catalog.
    pub fn snapshot(&self) -> Result<Arc<Catalog>, CatalogError> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| CatalogError::Poisoned)
    }

    /// Reload from disk and swap atomically. On failure the previous catalog
    /// stays active and the error is remembered for status reporting.
    pub fn reload(&self) -> Result<Arc<Catalog>, CatalogError> {
        match Catalog::load(&self.path) {
            Ok(catalog) => {
                let catalog = Arc::new(catalog);
                {
                    let mut guard = self.current.write().map_err(|_| CatalogError::Poisoned)?;
                    *guard = Arc::clone(&catalog);
                }
                if let Ok(mut err) = self.last_error.write() {
                    *err = None;
                }
                log::info!(
                    "catalog: reloaded {} entries from {}",
                    catalog.len(),
                    self.path.display()
                );
                Ok(catalog)
            }
            Err(e) => {
                log::warn!("catalog: reload rejected, keeping previous catalog: {}", e);
                if let Ok(mut err) = self.last_error.write() {
                    *err = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Most recent load failure, cleared by the next successful reload.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().ok().and_then(|guard| guard.clone())
    }
}
