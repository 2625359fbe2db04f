//! Core domain model, inbound record shapes and normalization rules for the CSL mirror.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "csl-core";

/// Upstream hard limit on results per request; local queries share it.
pub const MAX_PAGE_SIZE: u32 = 100;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Scalar attributes of a screening entity, overwritten wholesale on every upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityFields {
    pub name: String,
    pub alt_names: Vec<String>,
    pub source_list: String,
    pub source_information_url: Option<String>,
    pub source_list_url: Option<String>,
    pub programs: Vec<String>,
    pub federal_register_notice: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub remarks: Option<String>,
    pub entity_number: Option<String>,
    pub sdn_type: Option<String>,
    pub score: i32,
}

/// A sanctioned or restricted party as stored in the local mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningEntity {
    pub id: Uuid,
    pub external_id: String,
    #[serde(flatten)]
    pub fields: EntityFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub addresses: Vec<Address>,
    pub ids: Vec<IdentityDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

impl Address {
    /// One-line rendering used by the CLI.
    pub fn display_line(&self) -> String {
        let parts = [&self.address, &self.city, &self.country]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            "No address details".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub id_type: String,
    pub id_number: String,
    pub id_country: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
}

/// Address row to attach to an entity during an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NewAddress {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

impl NewAddress {
    pub fn into_address(self, entity_id: Uuid) -> Address {
        Address {
            id: Uuid::new_v4(),
            entity_id,
            address: self.address,
            city: self.city,
            state: self.state,
            country: self.country,
            postal_code: self.postal_code,
        }
    }
}

/// Identity document row to attach to an entity during an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NewIdentityDocument {
    pub id_type: String,
    pub id_number: String,
    pub id_country: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
}

impl NewIdentityDocument {
    pub fn into_document(self, entity_id: Uuid) -> IdentityDocument {
        IdentityDocument {
            id: Uuid::new_v4(),
            entity_id,
            id_type: self.id_type,
            id_number: self.id_number,
            id_country: self.id_country,
            issue_date: self.issue_date,
            expiration_date: self.expiration_date,
        }
    }
}

/// Fully prepared write for one entity: the store finds-or-creates by `external_id`,
/// overwrites `fields` and replaces both child collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityUpsert {
    pub external_id: String,
    pub fields: EntityFields,
    pub addresses: Vec<NewAddress>,
    pub ids: Vec<NewIdentityDocument>,
}

/// Audit row for a search issued against the upstream API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub id: Uuid,
    pub query_text: String,
    pub results_count: i64,
    pub user: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub search_params: SearchParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSearchQuery {
    pub query_text: String,
    pub user: Option<String>,
    pub search_params: SearchParams,
}

/// Filters for searching the local mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSearch {
    /// Case-insensitive substring over the name and alternate names.
    pub q: Option<String>,
    pub source_list: Option<String>,
    /// Case-insensitive exact match on any address country.
    pub country: Option<String>,
    pub limit: Option<u32>,
}

impl LocalSearch {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE)
    }
}

/// Outbound parameter set for the upstream search endpoint.
///
/// List-valued filters are already comma-joined. Also persisted verbatim as
/// `SearchQuery::search_params`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub name: Option<String>,
    pub sources: Option<String>,
    pub countries: Option<String>,
    pub types: Option<String>,
    pub fuzzy_name: Option<bool>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub size: Option<u32>,
    pub offset: Option<u32>,
}

impl SearchParams {
    /// Query-string pairs for every non-empty parameter. Zero `size`/`offset`
    /// count as empty and are not sent.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let text = [
            ("name", &self.name),
            ("sources", &self.sources),
            ("countries", &self.countries),
            ("types", &self.types),
        ];
        let location = [
            ("address", &self.address),
            ("city", &self.city),
            ("state", &self.state),
            ("postal_code", &self.postal_code),
        ];

        let mut pairs = Vec::new();
        for (key, value) in text {
            if let Some(value) = non_empty(value.as_deref()) {
                pairs.push((key, value.to_string()));
            }
        }
        if let Some(fuzzy) = self.fuzzy_name {
            pairs.push(("fuzzy_name", fuzzy.to_string()));
        }
        for (key, value) in location {
            if let Some(value) = non_empty(value.as_deref()) {
                pairs.push((key, value.to_string()));
            }
        }
        if let Some(size) = self.size.filter(|s| *s > 0) {
            pairs.push(("size", size.to_string()));
        }
        if let Some(offset) = self.offset.filter(|o| *o > 0) {
            pairs.push(("offset", offset.to_string()));
        }
        pairs
    }
}

/// Entity record as returned by the upstream API.
///
/// Every field tolerates `null` or absence; wrong-typed scalars become absent.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct EntityRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub source_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub alt_names: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub source_list: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub source_information_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub source_list_url: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub programs: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub federal_register_notice: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub start_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub end_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub remarks: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub entity_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sdn_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_score")]
    pub score: i32,
    #[serde(default, deserialize_with = "object_list")]
    pub addresses: Vec<AddressRecord>,
    #[serde(default, deserialize_with = "object_list")]
    pub ids: Vec<IdRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct AddressRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct IdRecord {
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub id_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub issue_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub expiration_date: Option<String>,
}

/// Parse an upstream `YYYY-MM-DD` date. Anything else yields `None`.
///
/// chrono alone accepts leading whitespace, signed and short years, so the
/// shape is checked byte by byte first.
pub fn normalize_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = non_empty(raw)?;
    if !has_date_shape(raw) {
        return None;
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

fn has_date_shape(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Reconciliation key for an upstream record: `source_id`, then `id`, then
/// `"{source_list}-{name}"`.
///
/// The synthesized form is not globally unique; two unidentified records with the
/// same list and name resolve to the same key and merge.
pub fn resolve_external_id(record: &EntityRecord) -> String {
    if let Some(id) = non_empty(record.source_id.as_deref()).or(non_empty(record.id.as_deref())) {
        return id.to_string();
    }
    format!(
        "{}-{}",
        record.source_list.as_deref().unwrap_or_default(),
        record.name.as_deref().unwrap_or_default()
    )
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        JsonValue::String(s) if !s.is_empty() => vec![s],
        _ => Vec::new(),
    })
}

fn lenient_score<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    let score = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.trunc() as i64))
        .unwrap_or(0);
    Ok(score.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
}

/// Lenient list of records: anything but an array is empty, and items that are
/// not objects or fail to decode are skipped.
pub fn object_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => decode_objects(items),
        _ => Vec::new(),
    })
}

pub fn decode_objects<T: DeserializeOwned>(items: Vec<JsonValue>) -> Vec<T> {
    items
        .into_iter()
        .filter(JsonValue::is_object)
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

/// A list published through the consolidated screening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceList {
    pub code: &'static str,
    pub name: &'static str,
    pub agency: &'static str,
    pub description: &'static str,
}

const OFAC: &str = "Office of Foreign Assets Control";
const BIS: &str = "Bureau of Industry and Security";
const STATE: &str = "State Department";

pub const SOURCE_LISTS: &[SourceList] = &[
    SourceList {
        code: "SDN",
        name: "Specially Designated Nationals",
        agency: OFAC,
        description: "Individuals and companies owned or controlled by, or acting for or on behalf of, targeted countries.",
    },
    SourceList {
        code: "FSE",
        name: "Foreign Sanctions Evaders",
        agency: OFAC,
        description: "Foreign individuals and entities determined to have violated, attempted to violate, conspired to violate, or caused a violation of U.S. sanctions.",
    },
    SourceList {
        code: "EL",
        name: "Entity List",
        agency: BIS,
        description: "Parties whose presence in a transaction can trigger a license requirement under the Export Administration Regulations.",
    },
    SourceList {
        code: "DPL",
        name: "Denied Persons List",
        agency: BIS,
        description: "Individuals and entities that have been denied export privileges.",
    },
    SourceList {
        code: "UVL",
        name: "Unverified List",
        agency: BIS,
        description: "Parties who BIS has been unable to verify in prior transactions.",
    },
    SourceList {
        code: "ISN",
        name: "Nonproliferation Sanctions",
        agency: STATE,
        description: "Parties that have been sanctioned under various statutes.",
    },
    SourceList {
        code: "DTC",
        name: "ITAR Debarred",
        agency: "Directorate of Defense Trade Controls",
        description: "Entities and individuals prohibited from participating in exports of defense articles and services.",
    },
    SourceList {
        code: "CAP",
        name: "Foreign Financial Institutions Subject to Part 561",
        agency: OFAC,
        description: "Foreign financial institutions subject to Part 561.",
    },
    SourceList {
        code: "SSI",
        name: "Sectoral Sanctions Identifications List",
        agency: OFAC,
        description: "Identifies persons operating in sectors of the Russian economy identified by the Secretary of the Treasury.",
    },
    SourceList {
        code: "MEU",
        name: "Military End User List",
        agency: BIS,
        description: "Parties that represent an unacceptable risk of use in or diversion to a 'military end use' or 'military end user'.",
    },
    SourceList {
        code: "NS-ISA",
        name: "Non-SDN Iranian Sanctions Act",
        agency: OFAC,
        description: "List of persons identified by OFAC as having certain Iran-related activities.",
    },
    SourceList {
        code: "PLC",
        name: "Palestinian Legislative Council List",
        agency: OFAC,
        description: "Members of the Palestinian Legislative Council who were elected on the party slate of Hamas or other designated entities.",
    },
    SourceList {
        code: "561",
        name: "Non-SDN Menu-Based Sanctions",
        agency: OFAC,
        description: "List of persons subject to non-SDN Menu-Based Sanctions",
    },
    SourceList {
        code: "CAPTA",
        name: "CAPTA List",
        agency: OFAC,
        description: "Foreign financial institutions subject to correspondent account or payable-through account sanctions.",
    },
    SourceList {
        code: "CMIC",
        name: "Non-SDN Chinese Military-Industrial Complex Companies List",
        agency: OFAC,
        description: "Chinese Military-Industrial Complex Companies",
    },
    SourceList {
        code: "FTO",
        name: "Foreign Terrorist Organizations",
        agency: STATE,
        description: "Foreign organizations that are designated by the Secretary of State.",
    },
    SourceList {
        code: "UKRAINE-EO",
        name: "Executive Order 13662 Directive Entities",
        agency: OFAC,
        description: "Entities subject to directives under EO 13662 regarding the situation in Ukraine.",
    },
];

pub const ENTITY_TYPES: &[&str] = &["Individual", "Entity", "Vessel", "Aircraft"];

pub fn source_list(code: &str) -> Option<&'static SourceList> {
    SOURCE_LISTS.iter().find(|s| s.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_dates_round_trip() {
        for raw in ["2020-01-31", "1999-12-01", "2024-02-29"] {
            let date = normalize_date(Some(raw)).expect("valid date");
            assert_eq!(date.format(DATE_FORMAT).to_string(), raw);
        }
    }

    #[test]
    fn malformed_dates_are_absent() {
        assert_eq!(normalize_date(None), None);
        assert_eq!(normalize_date(Some("")), None);
        assert_eq!(normalize_date(Some("31/01/2020")), None);
        assert_eq!(normalize_date(Some("2023-02-29")), None);
        assert_eq!(normalize_date(Some("2020-13-01")), None);
        assert_eq!(normalize_date(Some("2020-01-01T00:00:00Z")), None);
        assert_eq!(normalize_date(Some("not a date")), None);
        assert_eq!(normalize_date(Some(" 2020-01-01")), None);
        assert_eq!(normalize_date(Some("2020-01-01 ")), None);
        assert_eq!(normalize_date(Some("+2020-01-01")), None);
        assert_eq!(normalize_date(Some("20-01-01")), None);
        assert_eq!(normalize_date(Some("2020-1-01")), None);
        assert_eq!(normalize_date(Some("02020-01-01")), None);
    }

    #[test]
    fn external_id_prefers_source_id_then_id() {
        let mut record = EntityRecord {
            source_id: Some("src-1".into()),
            id: Some("id-1".into()),
            name: Some("Acme Corp".into()),
            source_list: Some("SDN".into()),
            ..Default::default()
        };
        assert_eq!(resolve_external_id(&record), "src-1");

        record.source_id = Some(String::new());
        assert_eq!(resolve_external_id(&record), "id-1");

        record.id = None;
        assert_eq!(resolve_external_id(&record), "SDN-Acme Corp");
    }

    #[test]
    fn record_tolerates_nulls_and_wrong_types() {
        let record: EntityRecord = serde_json::from_value(serde_json::json!({
            "id": 12345,
            "name": "Acme Corp",
            "alt_names": null,
            "programs": ["IRAN", 7],
            "start_date": 20200101,
            "score": 97.6,
            "addresses": null,
            "ids": [{"type": "Passport", "number": null}]
        }))
        .expect("lenient record");

        assert_eq!(record.id.as_deref(), Some("12345"));
        assert!(record.alt_names.is_empty());
        assert_eq!(record.programs, vec!["IRAN".to_string()]);
        assert_eq!(normalize_date(record.start_date.as_deref()), None);
        assert_eq!(record.score, 97);
        assert!(record.addresses.is_empty());
        assert_eq!(record.ids[0].id_type.as_deref(), Some("Passport"));
        assert_eq!(record.ids[0].number, None);
    }

    #[test]
    fn malformed_children_are_skipped() {
        let record: EntityRecord = serde_json::from_value(serde_json::json!({
            "id": "e-1",
            "addresses": ["1 Main St", null, {"city": "Tehran"}, 4],
            "ids": [null, {"type": "Passport", "number": 99}, "P123"]
        }))
        .expect("lenient children");

        assert_eq!(record.addresses.len(), 1);
        assert_eq!(record.addresses[0].city.as_deref(), Some("Tehran"));
        assert_eq!(record.ids.len(), 1);
        assert_eq!(record.ids[0].number.as_deref(), Some("99"));

        let record: EntityRecord =
            serde_json::from_value(serde_json::json!({"addresses": "1 Main St", "ids": {}}))
                .expect("non-array children");
        assert!(record.addresses.is_empty());
        assert!(record.ids.is_empty());
    }

    #[test]
    fn query_pairs_skip_empty_values() {
        let params = SearchParams {
            name: Some("acme".into()),
            sources: Some(String::new()),
            countries: Some("IR,RU".into()),
            fuzzy_name: Some(false),
            size: Some(50),
            offset: Some(0),
            ..Default::default()
        };
        assert_eq!(
            params.query_pairs(),
            vec![
                ("name", "acme".to_string()),
                ("countries", "IR,RU".to_string()),
                ("fuzzy_name", "false".to_string()),
                ("size", "50".to_string()),
            ]
        );
        assert!(SearchParams::default().query_pairs().is_empty());
    }

    #[test]
    fn source_list_lookup_is_case_insensitive() {
        assert_eq!(source_list("sdn").map(|s| s.agency), Some(OFAC));
        assert!(source_list("NOPE").is_none());
        assert_eq!(SOURCE_LISTS.len(), 17);
    }

    #[test]
    fn address_display_line_skips_blanks() {
        let address = NewAddress {
            address: Some("1 Main St".into()),
            city: Some(String::new()),
            country: Some("IR".into()),
            ..Default::default()
        }
        .into_address(Uuid::new_v4());
        assert_eq!(address.display_line(), "1 Main St, IR");
        assert_eq!(
            NewAddress::default().into_address(Uuid::new_v4()).display_line(),
            "No address details"
        );
    }
}
