// 🏗️ Evidence Document Parser
// Turns one evidence record (YAML mapping) into an EvidenceDocument.
//
// Whole-document failures: unparsable YAML (repeated keys included) or a non-mapping top level
// (MalformedDocument), absent or non-list `transactions`
// (MissingRequiredSection). Per-transaction failures only drop that entry.

use crate::coordinates::Coordinate;
use crate::error::{ReconcileError, Result};
use crate::normalize::ParcelId;
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const DOCUMENT_ID_KEYS: &[&str] = &[
    "document_id",
    "certificate_id",
    "certificate_number",
    "cert_id",
    "document",
];
const FINGERPRINT_KEYS: &[&str] = &["content_fingerprint", "sha256"];
const SIGNING_DATE_KEYS: &[&str] = &["signing_date", "date_signed", "date_closed"];
const COORDINATE_PAIR_KEYS: &[&str] = &["gps", "coordinates"];

// ============================================================================
// CORE TYPES
// ============================================================================

/// Optional descriptive fields, passed through to the store unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub registry_key: Option<String>,
    pub escrow_id: Option<String>,
    pub transfer_bank: Option<String>,
    pub country: Option<String>,
    pub routing_code: Option<String>,
    pub account_fragment: Option<String>,
    pub link: Option<String>,
    pub signing_date: Option<String>,
}

/// One grantor -> grantee fact extracted from a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    // Required
    pub grantor: String,
    pub grantee: String,

    // Optional
    pub amount: Option<String>,
    pub raw_parcel_id: Option<String>,
    pub parcel_id: Option<ParcelId>,
    pub inline_coordinate: Option<Coordinate>,
    pub details: TransactionDetails,
}

impl Transaction {
    pub fn new(grantor: &str, grantee: &str) -> Self {
        Transaction {
            grantor: grantor.to_string(),
            grantee: grantee.to_string(),
            amount: None,
            raw_parcel_id: None,
            parcel_id: None,
            inline_coordinate: None,
            details: TransactionDetails::default(),
        }
    }

    /// Builder pattern: set raw parcel id (normalized on the way in)
    pub fn with_parcel_id(mut self, raw: &str) -> Self {
        self.parcel_id = ParcelId::parse(raw);
        self.raw_parcel_id = Some(raw.to_string());
        self
    }

    /// Builder pattern: add amount
    pub fn with_amount(mut self, amount: &str) -> Self {
        self.amount = Some(amount.to_string());
        self
    }

    /// Builder pattern: add inline coordinate
    pub fn with_coordinate(mut self, latitude: f64, longitude: f64) -> Self {
        self.inline_coordinate = Coordinate::new(latitude, longitude);
        self
    }

    /// Builder pattern: replace descriptive fields
    pub fn with_details(mut self, details: TransactionDetails) -> Self {
        self.details = details;
        self
    }
}

/// Why a transaction entry was dropped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTransaction {
    /// 1-based position in the document's transactions list
    pub index: usize,
    pub reason: String,
}

/// One parsed evidence record
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceDocument {
    pub document_id: String,
    pub content_fingerprint: String,
    pub source_file: String,
    pub transactions: Vec<Transaction>,
    pub skipped: Vec<SkippedTransaction>,
}

// ============================================================================
// PARSING
// ============================================================================

/// Read and parse one evidence file
pub fn parse_document_file(path: &Path) -> Result<EvidenceDocument> {
    let bytes = fs::read(path)?;
    let source_file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.yaml")
        .to_string();

    parse_document(&source_file, &bytes)
}

/// Parse one evidence record from raw bytes
///
/// `source_file` is the record's file name; it provides the document id when
/// the record carries none.
pub fn parse_document(source_file: &str, bytes: &[u8]) -> Result<EvidenceDocument> {
    let root: Value = serde_yaml::from_slice(bytes).map_err(|e| ReconcileError::MalformedDocument {
        document: source_file.to_string(),
        reason: e.to_string(),
    })?;

    let map = match untag(&root) {
        Value::Mapping(map) => map,
        other => {
            return Err(ReconcileError::MalformedDocument {
                document: source_file.to_string(),
                reason: format!("top level is {}, expected a mapping", kind(other)),
            })
        }
    };

    let entries = match map.get("transactions").map(untag) {
        Some(Value::Sequence(entries)) => entries,
        _ => {
            return Err(ReconcileError::MissingRequiredSection {
                document: source_file.to_string(),
            })
        }
    };

    let spellings = read_spellings(bytes, map, entries);
    let no_spellings = HashMap::new();
    let fields = Fields {
        map,
        spelled: &spellings.document,
    };

    let document_id = fields.first_text(DOCUMENT_ID_KEYS).unwrap_or_else(|| file_stem(source_file));
    let content_fingerprint = fields.first_text(FINGERPRINT_KEYS).unwrap_or_else(|| fingerprint(bytes));

    let mut transactions = Vec::with_capacity(entries.len());
    let mut skipped = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let index = i + 1;
        let spelled = spellings.entries.get(i).unwrap_or(&no_spellings);
        match parse_transaction(entry, spelled) {
            Ok(tx) => transactions.push(tx),
            Err(field) => {
                let err = ReconcileError::IncompleteTransaction {
                    document: document_id.clone(),
                    index,
                    field: field.to_string(),
                };
                warn!("skipping transaction: {}", err);
                skipped.push(SkippedTransaction {
                    index,
                    reason: err.to_string(),
                });
            }
        }
    }

    debug!(
        document = %document_id,
        accepted = transactions.len(),
        skipped = skipped.len(),
        "parsed evidence document"
    );

    Ok(EvidenceDocument {
        document_id,
        content_fingerprint,
        source_file: source_file.to_string(),
        transactions,
        skipped,
    })
}

/// Parse one transaction entry; `Err` names what is missing
fn parse_transaction(
    entry: &Value,
    spelled: &HashMap<String, String>,
) -> std::result::Result<Transaction, &'static str> {
    let map = match untag(entry) {
        Value::Mapping(map) => map,
        _ => return Err("a mapping body"),
    };
    let fields = Fields { map, spelled };

    let grantor = fields.text("grantor").ok_or("grantor")?;
    let grantee = fields.text("grantee").ok_or("grantee")?;

    let raw_parcel_id = fields.text("parcel_id");
    let parcel_id = raw_parcel_id.as_deref().and_then(ParcelId::parse);

    Ok(Transaction {
        grantor,
        grantee,
        amount: fields.text("amount"),
        raw_parcel_id,
        parcel_id,
        inline_coordinate: inline_coordinate(map),
        details: TransactionDetails {
            registry_key: fields.text("registry_key"),
            escrow_id: fields.text("escrow_id"),
            transfer_bank: fields.text("transfer_bank"),
            country: fields.text("country"),
            routing_code: fields.text("routing_code"),
            account_fragment: fields.text("account_fragment"),
            link: fields.text("link"),
            signing_date: fields.first_text(SIGNING_DATE_KEYS),
        },
    })
}

/// `gps: [lat, lon]`, `coordinates: [lat, lon]`, or `latitude` + `longitude`
fn inline_coordinate(map: &Mapping) -> Option<Coordinate> {
    for key in COORDINATE_PAIR_KEYS {
        if let Some(Value::Sequence(pair)) = map.get(*key).map(untag) {
            if pair.len() == 2 {
                return Coordinate::new(number(&pair[0])?, number(&pair[1])?);
            }
            return None;
        }
    }

    let latitude = map.get("latitude").and_then(number)?;
    let longitude = map.get("longitude").and_then(number)?;
    Coordinate::new(latitude, longitude)
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

fn untag(value: &Value) -> &Value {
    match value {
        Value::Tagged(tagged) => untag(&tagged.value),
        other => other,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Scalar as trimmed text; null, blank and non-scalars are absent
fn scalar_text(value: &Value) -> Option<String> {
    let text = match untag(value) {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// A mapping plus the source text of its numeric and boolean scalars
struct Fields<'a> {
    map: &'a Mapping,
    spelled: &'a HashMap<String, String>,
}

impl Fields<'_> {
    fn text(&self, key: &str) -> Option<String> {
        match self.spelled.get(key) {
            Some(raw) => Some(raw.trim().to_string()).filter(|t| !t.is_empty()),
            None => self.map.get(key).and_then(scalar_text),
        }
    }

    fn first_text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.text(key))
    }
}

/// Finite number from a YAML number or a numeric string
fn number(value: &Value) -> Option<f64> {
    let n = match untag(value) {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if n.is_finite() {
        Some(n)
    } else {
        None
    }
}

fn file_stem(source_file: &str) -> String {
    Path::new(source_file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(source_file)
        .to_string()
}

// ============================================================================
// SOURCE SPELLINGS
// ============================================================================
//
// `Value` keeps a resolved number, not its text: `3.740` becomes 3.74 and
// `0x1F` becomes 31. Text fields must carry what the record says, so the
// scalars YAML resolved to numbers or booleans are read a second time,
// straight from the bytes, as strings. The `Value` pass supplies the shape.

#[derive(Debug, Default)]
struct Spellings {
    document: HashMap<String, String>,
    entries: Vec<HashMap<String, String>>,
}

fn read_spellings(bytes: &[u8], root: &Mapping, entries: &[Value]) -> Spellings {
    let seed = SpellingSeed {
        shape: root,
        entries: Some(entries),
    };

    match seed.deserialize(serde_yaml::Deserializer::from_slice(bytes)) {
        Ok(spellings) => spellings,
        Err(e) => {
            debug!("source spellings unavailable, using resolved scalars: {}", e);
            Spellings::default()
        }
    }
}

fn needs_spelling(value: &Value) -> bool {
    matches!(untag(value), Value::Number(_) | Value::Bool(_))
}

/// One mapping; `entries` is set only at the top level
struct SpellingSeed<'a> {
    shape: &'a Mapping,
    entries: Option<&'a [Value]>,
}

impl<'de> DeserializeSeed<'de> for SpellingSeed<'_> {
    type Value = Spellings;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<Spellings, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for SpellingSeed<'_> {
    type Value = Spellings;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a mapping")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Spellings, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut spellings = Spellings::default();

        while let Some(key) = map.next_key_seed(KeySeed)? {
            match (key, self.entries) {
                (Some(key), Some(entries)) if key == "transactions" => {
                    spellings.entries = map.next_value_seed(EntriesSeed(entries))?;
                }
                (Some(key), _) if self.shape.get(key.as_str()).map_or(false, needs_spelling) => {
                    let text: String = map.next_value()?;
                    spellings.document.insert(key, text);
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        Ok(spellings)
    }
}

/// The transactions list, guided by the entries already parsed as `Value`
struct EntriesSeed<'a>(&'a [Value]);

impl<'de> DeserializeSeed<'de> for EntriesSeed<'_> {
    type Value = Vec<HashMap<String, String>>;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for EntriesSeed<'_> {
    type Value = Vec<HashMap<String, String>>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a transactions list")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut out = Vec::with_capacity(self.0.len());

        for entry in self.0 {
            let spelled = match untag(entry) {
                Value::Mapping(shape) => seq
                    .next_element_seed(SpellingSeed { shape, entries: None })?
                    .map(|s| s.document),
                _ => seq.next_element::<IgnoredAny>()?.map(|_| HashMap::new()),
            };
            match spelled {
                Some(spelled) => out.push(spelled),
                None => break,
            }
        }
        while seq.next_element::<IgnoredAny>()?.is_some() {}

        Ok(out)
    }
}

/// Mapping keys as text; non-string keys are kept out of the lookup
struct KeySeed;

impl<'de> DeserializeSeed<'de> for KeySeed {
    type Value = Option<String>;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for KeySeed {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a mapping key")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
        Ok(Some(v.to_string()))
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(None)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
        Ok(None)
    }
}

/// SHA-256 hex digest of the raw record
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================
